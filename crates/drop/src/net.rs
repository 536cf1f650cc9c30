use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use nix::net::if_::if_nametoindex;

/// Split `host[:port]`, `[v6addr][:port]` or a bare IPv6 address.
///
/// An empty host is returned as is; resolving it yields the unspecified or
/// loopback address.
pub fn split_host_port(input: &str, default_port: u16) -> Result<(String, u16)> {
    let (host, port) = if let Some(rest) = input.strip_prefix('[') {
        let Some((host, after)) = rest.split_once(']') else {
            bail!("Missing ']' in address '{}'", input);
        };
        match after {
            "" => (host, None),
            _ => match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => bail!("Unexpected '{}' after address in '{}'", after, input),
            },
        }
    } else if input.matches(':').count() == 1 {
        let (host, port) = input.split_once(':').unwrap_or((input, ""));
        (host, Some(port))
    } else {
        (input, None)
    };

    let port = match port {
        Some(port) => port
            .parse()
            .with_context(|| format!("Invalid port '{}' in '{}'", port, input))?,
        None => default_port,
    };
    Ok((host.to_string(), port))
}

/// Attach the interface index of `interface` to an IPv6 address that has no scope yet.
///
/// Link-local servers are only reachable through a named interface.
pub fn with_interface_scope(addr: SocketAddr, interface: &str) -> Result<SocketAddr> {
    let index = if_nametoindex(interface).with_context(|| format!("Network interface '{}' not found", interface))?;

    match addr {
        SocketAddr::V6(mut v6) if v6.scope_id() == 0 => {
            v6.set_scope_id(index);
            Ok(SocketAddr::V6(v6))
        }
        SocketAddr::V6(_) => Ok(addr),
        SocketAddr::V4(_) => {
            tracing::warn!("Ignoring interface '{}' for IPv4 server {}", interface, addr);
            Ok(addr)
        }
    }
}

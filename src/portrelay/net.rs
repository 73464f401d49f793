use std::{borrow::Cow, fmt, net::Ipv6Addr};

/// Normalize a bind/listen address.
///
/// The shorthand `":PORT"` means "bind on all interfaces". Rust's `SocketAddr`
/// parsing and Tokio bind APIs do not accept it, so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Join a bare host and a port into a dialable/bindable address.
///
/// IPv6 literals are bracketed.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid address {input:?}: {reason}")]
pub struct AddrSpecError {
    input: String,
    reason: &'static str,
}

impl AddrSpecError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

/// A listen or target address as written by the user.
///
/// `Bare` carries only a host (IPv6 literals are stored without brackets) and
/// needs a port before it can be used. `Explicit` is a complete `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostSpec {
    Bare(String),
    Explicit(String),
}

impl HostSpec {
    pub fn parse(input: &str) -> Result<Self, AddrSpecError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(AddrSpecError::new(input, "empty address"));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let Some((host, tail)) = rest.split_once(']') else {
                return Err(AddrSpecError::new(input, "unterminated '['"));
            };
            if host.is_empty() {
                return Err(AddrSpecError::new(input, "empty host"));
            }
            if tail.is_empty() {
                return Ok(HostSpec::Bare(host.to_string()));
            }
            let Some(port) = tail.strip_prefix(':') else {
                return Err(AddrSpecError::new(input, "expected ':' after ']'"));
            };
            parse_port(input, port)?;
            return Ok(HostSpec::Explicit(s.to_string()));
        }

        // Unbracketed IPv6 literal, e.g. "::1" or "fe80::1".
        if s.parse::<Ipv6Addr>().is_ok() {
            return Ok(HostSpec::Bare(s.to_string()));
        }

        match s.rsplit_once(':') {
            None => Ok(HostSpec::Bare(s.to_string())),
            Some((host, port)) => {
                if host.contains(':') {
                    return Err(AddrSpecError::new(
                        input,
                        "IPv6 host with a port must be bracketed",
                    ));
                }
                parse_port(input, port)?;
                Ok(HostSpec::Explicit(s.to_string()))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            HostSpec::Bare(s) | HostSpec::Explicit(s) => s,
        }
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn parse_port(input: &str, port: &str) -> Result<u16, AddrSpecError> {
    if port.is_empty() {
        return Err(AddrSpecError::new(input, "empty port"));
    }
    port.parse::<u16>()
        .map_err(|_| AddrSpecError::new(input, "port must be an integer in 0-65535"))
}

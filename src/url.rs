//! URL parsing for tcp:// server addresses.

use anyhow::{bail, Result};

pub const DEFAULT_PORT: u16 = 8080;

/// Parse `tcp://host:port`, `host:port`, or bare `host` into an address
/// string suitable for `TcpStream::connect`. A missing port defaults to
/// [`DEFAULT_PORT`].
pub fn parse_url(url: &str) -> Result<String> {
    let trimmed = url.trim();
    let rest = trimmed.strip_prefix("tcp://").unwrap_or(trimmed);
    if rest.is_empty() {
        bail!("empty server url {url:?}");
    }
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                bail!("missing host in {url:?}");
            }
            let port: u16 = port
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid port in {url:?}"))?;
            (host, port)
        }
        None => (rest, DEFAULT_PORT),
    };
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_url() {
        assert_eq!(parse_url("tcp://10.0.0.5:9000").unwrap(), "10.0.0.5:9000");
    }

    #[test]
    fn scheme_optional() {
        assert_eq!(parse_url("localhost:8081").unwrap(), "localhost:8081");
    }

    #[test]
    fn port_defaults() {
        assert_eq!(parse_url("tcp://example.com").unwrap(), "example.com:8080");
        assert_eq!(parse_url("example.com").unwrap(), "example.com:8080");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_url("").is_err());
        assert!(parse_url("tcp://").is_err());
        assert!(parse_url(":9000").is_err());
        assert!(parse_url("host:notaport").is_err());
    }
}

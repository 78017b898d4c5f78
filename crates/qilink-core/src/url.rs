//! Endpoint URLs: `tcp://host:port`, `tcps://host:port`, `unix:///path`.

use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Conventional service-directory port.
pub const DEFAULT_PORT: u16 = 9559;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tcp,
    /// Parsed for interoperability; connecting over it is rejected.
    Tcps,
    Unix,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Tcps => "tcps",
            Scheme::Unix => "unix",
        }
    }
}

/// A parsed endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Url {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
}

impl Url {
    pub fn tcp(host: &str, port: u16) -> Self {
        Self {
            scheme: Scheme::Tcp,
            host: host.to_owned(),
            port,
            path: String::new(),
        }
    }

    pub fn unix(path: &str) -> Self {
        Self {
            scheme: Scheme::Unix,
            host: String::new(),
            port: 0,
            path: path.to_owned(),
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Same endpoint with a different port (used to advertise the port an
    /// ephemeral bind actually got).
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Unix => write!(f, "unix://{}", self.path),
            scheme => write!(f, "{}://{}:{}", scheme.as_str(), self.host, self.port),
        }
    }
}

impl FromStr for Url {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| Error::UnsupportedScheme(s.to_owned()))?;
        let scheme = match scheme {
            "tcp" => Scheme::Tcp,
            "tcps" => Scheme::Tcps,
            "unix" => {
                if !rest.starts_with('/') || rest.len() < 2 {
                    return Err(Error::UnsupportedScheme(s.to_owned()));
                }
                return Ok(Url::unix(rest));
            }
            other => return Err(Error::UnsupportedScheme(other.to_owned())),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::UnsupportedScheme(s.to_owned()))?;
                (host, port)
            }
            None => (rest, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(Error::UnsupportedScheme(s.to_owned()));
        }
        Ok(Url {
            scheme,
            host: host.to_owned(),
            port,
            path: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp() {
        let url: Url = "tcp://127.0.0.1:9559".parse().unwrap();
        assert_eq!(url.scheme(), Scheme::Tcp);
        assert_eq!(url.host(), "127.0.0.1");
        assert_eq!(url.port(), 9559);
        assert_eq!(url.to_string(), "tcp://127.0.0.1:9559");
    }

    #[test]
    fn default_port() {
        let url: Url = "tcp://directory.local".parse().unwrap();
        assert_eq!(url.port(), DEFAULT_PORT);
    }

    #[test]
    fn parse_unix() {
        let url: Url = "unix:///tmp/qilink.sock".parse().unwrap();
        assert_eq!(url.scheme(), Scheme::Unix);
        assert_eq!(url.path(), "/tmp/qilink.sock");
        assert_eq!(url.to_string(), "unix:///tmp/qilink.sock");
    }

    #[test]
    fn parse_tcps() {
        let url: Url = "tcps://h:1".parse().unwrap();
        assert_eq!(url.scheme(), Scheme::Tcps);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Url>().is_err());
        assert!("http://x".parse::<Url>().is_err());
        assert!("tcp://".parse::<Url>().is_err());
        assert!("tcp://h:notaport".parse::<Url>().is_err());
        assert!("unix://relative".parse::<Url>().is_err());
    }
}

//! Service URLs: `scheme[+transport]://[user@]host[:port][/path]`.

use std::fmt;

use crate::error::{SchedError, SchedResult};

/// How commands reach the scheduler's submit host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Local,
    Ssh,
}

/// A parsed service URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUrl {
    scheme: String,
    transport: Transport,
    user: Option<String>,
    host: String,
    port: Option<u16>,
    path: Option<String>,
}

impl ResourceUrl {
    pub fn parse(url: &str) -> SchedResult<Self> {
        let (scheme_part, rest) = url
            .trim()
            .split_once("://")
            .ok_or_else(|| SchedError::Parameter(format!("URL '{url}' has no scheme")))?;

        let (scheme, transport) = match scheme_part.split_once('+') {
            Some((scheme, "ssh")) => (scheme, Some(Transport::Ssh)),
            Some((scheme, "local" | "fork")) => (scheme, Some(Transport::Local)),
            Some((_, other)) => {
                return Err(SchedError::Parameter(format!(
                    "unsupported transport '{other}' in '{url}'"
                )));
            }
            None => (scheme_part, None),
        };
        if scheme.is_empty() {
            return Err(SchedError::Parameter(format!("URL '{url}' has no scheme")));
        }

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], Some(rest[idx..].to_string())),
            None => (rest, None),
        };
        let (user, host_port) = match authority.rsplit_once('@') {
            Some((user, hp)) => (Some(user.to_string()), hp),
            None => (None, authority),
        };
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| SchedError::Parameter(format!("invalid port in '{url}'")))?;
                (host, Some(port))
            }
            None => (host_port, None),
        };

        let host = host.to_string();
        let transport = transport.unwrap_or(if is_local_host(&host) {
            Transport::Local
        } else {
            Transport::Ssh
        });

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            transport,
            user,
            host,
            port,
            path: path.filter(|p| p != "/"),
        })
    }

    /// Adaptor scheme (`slurm`, `pbs`, ...).
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

impl fmt::Display for ResourceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.scheme)?;
        match self.transport {
            Transport::Ssh if is_local_host(&self.host) => f.write_str("+ssh")?,
            Transport::Local if !is_local_host(&self.host) => f.write_str("+local")?,
            _ => {}
        }
        f.write_str("://")?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if let Some(path) = &self.path {
            f.write_str(path)?;
        }
        Ok(())
    }
}

fn is_local_host(host: &str) -> bool {
    matches!(host, "" | "localhost" | "127.0.0.1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote() {
        let url = ResourceUrl::parse("slurm+ssh://alice@login.hpc.example.org:2222/scratch").unwrap();
        assert_eq!(url.scheme(), "slurm");
        assert_eq!(url.transport(), Transport::Ssh);
        assert_eq!(url.user(), Some("alice"));
        assert_eq!(url.host(), "login.hpc.example.org");
        assert_eq!(url.port(), Some(2222));
        assert_eq!(url.path(), Some("/scratch"));
        assert_eq!(
            url.to_string(),
            "slurm://alice@login.hpc.example.org:2222/scratch"
        );
    }

    #[test]
    fn test_default_transport() {
        assert_eq!(
            ResourceUrl::parse("pbs://localhost").unwrap().transport(),
            Transport::Local
        );
        assert_eq!(
            ResourceUrl::parse("noop://").unwrap().transport(),
            Transport::Local
        );
        assert_eq!(
            ResourceUrl::parse("sge://cluster").unwrap().transport(),
            Transport::Ssh
        );
        assert_eq!(
            ResourceUrl::parse("pbs+ssh://localhost").unwrap().to_string(),
            "pbs+ssh://localhost"
        );
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(ResourceUrl::parse("login.hpc").is_err());
        assert!(ResourceUrl::parse("slurm+gsissh://host").is_err());
        assert!(ResourceUrl::parse("slurm://host:notaport").is_err());
    }
}

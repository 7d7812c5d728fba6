//! Transport types for manager-shim communication.

use std::path::PathBuf;

/// Transport mechanism for the shim's RPC endpoint.
///
/// Represents the underlying connection type used by both the manager (to
/// dial) and the shim (to listen). Named pipes are the Windows contract;
/// Unix sockets are the fallback everywhere else; TCP exists for tests.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Transport {
    /// TCP transport (loopback only).
    Tcp { port: u16 },

    /// Unix socket transport.
    Unix { socket_path: PathBuf },

    /// Windows named-pipe transport. `name` is the full pipe path,
    /// e.g. `\\.\pipe\ProtectedPrefix\Administrators\hcslite-shim-...`.
    Pipe { name: String },
}

impl Transport {
    /// Create a TCP transport.
    pub fn tcp(port: u16) -> Self {
        Self::Tcp { port }
    }

    /// Create a Unix socket transport.
    pub fn unix(socket_path: PathBuf) -> Self {
        Self::Unix { socket_path }
    }

    /// Create a named-pipe transport from a full pipe path.
    pub fn pipe(name: impl Into<String>) -> Self {
        Self::Pipe { name: name.into() }
    }

    /// Get the URI representation of this transport.
    pub fn to_uri(&self) -> String {
        match self {
            Transport::Tcp { port } => format!("tcp://127.0.0.1:{}", port),
            Transport::Unix { socket_path } => format!("unix://{}", socket_path.display()),
            Transport::Pipe { name } => format!("npipe://{}", name),
        }
    }

    /// Parse a transport from a URI string.
    ///
    /// Raw pipe paths (`\\.\pipe\...`) are accepted without a scheme, since
    /// that is how Windows managers hand addresses around.
    pub fn from_uri(uri: &str) -> Result<Self, String> {
        if let Some(rest) = uri.strip_prefix("tcp://") {
            let port = rest
                .split(':')
                .nth(1)
                .ok_or_else(|| format!("invalid TCP URI '{}': missing port", uri))?
                .parse::<u16>()
                .map_err(|e| format!("invalid TCP port in '{}': {}", uri, e))?;
            Ok(Self::tcp(port))
        } else if let Some(path) = uri.strip_prefix("unix://") {
            Ok(Self::unix(PathBuf::from(path)))
        } else if let Some(name) = uri.strip_prefix("npipe://") {
            Ok(Self::pipe(name))
        } else if uri.starts_with(r"\\.\pipe\") {
            Ok(Self::pipe(uri))
        } else {
            Err(format!(
                "invalid transport URI '{}': expected tcp://, unix://, npipe://, or a raw pipe path",
                uri
            ))
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_uri())
    }
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_uri(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_round_trips() {
        let cases = [
            Transport::tcp(9400),
            Transport::unix(PathBuf::from("/run/hcslite/t1.sock")),
            Transport::pipe(r"\\.\pipe\ProtectedPrefix\Administrators\hcslite-shim-default-t1-pipe"),
        ];
        for t in cases {
            assert_eq!(Transport::from_uri(&t.to_uri()), Ok(t));
        }
    }

    #[test]
    fn raw_pipe_path_is_accepted() {
        let parsed = Transport::from_uri(r"\\.\pipe\hcslite-test").unwrap();
        assert_eq!(parsed, Transport::pipe(r"\\.\pipe\hcslite-test"));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(Transport::from_uri("vsock://1234").is_err());
        assert!(Transport::from_uri("t1").is_err());
    }

    #[test]
    fn tcp_requires_port() {
        assert!(Transport::from_uri("tcp://127.0.0.1").is_err());
    }

    proptest::proptest! {
        #[test]
        fn any_tcp_port_round_trips(port: u16) {
            let t = Transport::tcp(port);
            proptest::prop_assert_eq!(Transport::from_uri(&t.to_uri()), Ok(t));
        }

        #[test]
        fn pipe_names_round_trip(name in "[A-Za-z0-9][A-Za-z0-9-]{0,40}") {
            let t = Transport::pipe(format!(r"\\.\pipe\{name}"));
            proptest::prop_assert_eq!(Transport::from_uri(&t.to_uri()), Ok(t));
        }
    }
}

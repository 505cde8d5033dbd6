use serde::{Deserialize, Serialize};

/// The kind of traffic a service port carries through the mesh.
///
/// Selects the mesh port range and the router category a service port is
/// rendered into.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficType {
    #[default]
    Http,
    Tcp,
    Udp,
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("unsupported traffic type: {0:?}")]
pub struct InvalidTrafficTypeError(pub String);

impl std::str::FromStr for TrafficType {
    type Err = InvalidTrafficTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(InvalidTrafficTypeError(other.to_string())),
        }
    }
}

impl std::fmt::Display for TrafficType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => "http".fmt(f),
            Self::Tcp => "tcp".fmt(f),
            Self::Udp => "udp".fmt(f),
        }
    }
}

/// URL scheme used for HTTP backend servers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Scheme {
    #[default]
    Http,
    Https,
    H2c,
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("unsupported scheme: {0:?}")]
pub struct InvalidSchemeError(pub String);

impl std::str::FromStr for Scheme {
    type Err = InvalidSchemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "h2c" => Ok(Self::H2c),
            other => Err(InvalidSchemeError(other.to_string())),
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => "http".fmt(f),
            Self::Https => "https".fmt(f),
            Self::H2c => "h2c".fmt(f),
        }
    }
}

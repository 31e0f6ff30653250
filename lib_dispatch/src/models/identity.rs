use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side of a ride the local device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    /// The passenger requesting rides.
    Rider,
    /// The driver accepting and serving rides.
    Driver,
}

impl UserRole {
    /// The opposite party of a ride.
    pub fn counterparty(self) -> UserRole {
        match self {
            UserRole::Rider => UserRole::Driver,
            UserRole::Driver => UserRole::Rider,
        }
    }

    /// Wire name used in outbound frames.
    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Rider => "rider",
            UserRole::Driver => "driver",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rider" => Ok(UserRole::Rider),
            "driver" => Ok(UserRole::Driver),
            other => Err(format!("unknown role '{}', expected rider or driver", other)),
        }
    }
}

/// The user a connection is registered for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub role: UserRole,
    pub user_id: String,
}

impl Identity {
    pub fn new(role: UserRole, user_id: impl Into<String>) -> Self {
        Self {
            role,
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.user_id)
    }
}

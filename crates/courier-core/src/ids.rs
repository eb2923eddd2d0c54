use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id!(ClientId, "client");
branded_id!(InstanceId, "inst");
branded_id!(ChannelId, "chan");

const SERVER_IDENTITY: &str = "server";
const BROADCAST_TARGET: &str = "*";

impl ClientId {
    /// Sender identity used on responses generated by a manager.
    pub fn server() -> Self {
        Self(SERVER_IDENTITY.to_owned())
    }

    /// Well-known recipient for envelopes fanned out to every local client.
    pub fn broadcast() -> Self {
        Self(BROADCAST_TARGET.to_owned())
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == BROADCAST_TARGET
    }
}

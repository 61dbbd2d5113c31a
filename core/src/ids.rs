use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

const ID_LEN: usize = 12;

fn short_token() -> String {
    let mut token = Uuid::new_v4().simple().to_string();
    token.truncate(ID_LEN);
    token
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub(crate) fn generate() -> Self {
                Self(short_token())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// Identifier of an interactive pty session.
    SessionId
);

opaque_id!(
    /// Identifier of a background job.
    ExecId
);

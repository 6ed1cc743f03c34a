//! Identifiers shared between the queue, workers and job clients.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde_derive::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Serialize, Deserialize, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug,
            derive_more::Display,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// A worker machine, as named by the worker itself.
    WorkerId
);
string_id!(
    /// A submitted job.
    JobId
);
string_id!(
    /// Jobs sharing a group id share a group priority.
    JobGroupId
);
string_id!(
    /// Name of a test, e.g. `LoginTests/testLogout`.
    TestName
);
string_id!(
    /// Caller-chosen idempotency token for dequeue, result and schedule calls.
    RequestId
);

impl RequestId {
    pub fn unique() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct BucketId(pub uuid::Uuid);

impl BucketId {
    #[allow(clippy::new_without_default)] // Bucket IDs should be fresh, not defaulted
    pub fn unique() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

pub const SIGNATURE_LEN: usize = 30;

/// Random token the queue hands out at registration; workers must echo it on every
/// subsequent request so that results from a previous queue instance are refused.
#[derive(Serialize, Deserialize, Clone, Hash, PartialEq, Eq, Debug, derive_more::Display)]
#[serde(transparent)]
pub struct PayloadSignature(String);

impl PayloadSignature {
    pub fn new_random() -> Self {
        let mut rng: ChaCha20Rng = SeedableRng::from_entropy();
        let signature = (0..SIGNATURE_LEN)
            .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
            .collect();
        Self(signature)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PayloadSignature {
    fn from(signature: &str) -> Self {
        Self(signature.to_owned())
    }
}

use std::fmt::Display;

use serde::{Deserialize, Serialize};

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize, Debug)]
#[serde(transparent)]
pub struct Information(u64);

impl Information {
    pub const ZERO: Information = Information(0);

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.bytes() * 8
    }

    #[must_use]
    pub const fn bytes(self) -> u64 {
        self.0
    }
}

#[must_use]
pub const fn bytes(value: u64) -> Information {
    Information(value)
}

impl Display for Information {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}B", self.0)
    }
}

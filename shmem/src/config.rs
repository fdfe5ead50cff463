use serde_derive::{Deserialize, Serialize};

/// Keys and sizing every cooperating process must agree on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmConfig {
    pub shm_key: u32,
    pub sem_key: u32,
    pub max_node_count: u32,
}

impl Default for ShmConfig {
    fn default() -> Self {
        ShmConfig {
            shm_key: 0x5c7f,
            sem_key: 0x5c80,
            max_node_count: 100,
        }
    }
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct WriterConfig {
    pub shm: ShmConfig,
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct ReaderConfig {
    pub shm: ShmConfig,
}

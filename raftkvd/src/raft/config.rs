use raftkv_api::NodeId;
use thiserror::Error;
use typed_builder::TypedBuilder;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("node id can't be zero")]
    InvalidId,
    #[error("heartbeat tick must be greater than 0")]
    HeartbeatTick,
    #[error("election tick must be greater than heartbeat tick")]
    ElectionTick,
    #[error("storage is missing")]
    MissingStorage,
}

pub const DEFAULT_ELECTION_TICK: usize = 10;
pub const DEFAULT_HEARTBEAT_TICK: usize = 2;

/// Parameters to start a [`super::Raft`] node with
#[derive(TypedBuilder, Debug)]
pub struct Config<S> {
    /// Id of the local node
    pub id: NodeId,

    /// Initial members (including the local node)
    ///
    /// When empty, the membership stored in `storage` is used.
    #[builder(default)]
    pub peers: Vec<NodeId>,

    /// Number of ticks without hearing from a leader before starting
    /// an election; the actual timeout is randomized between this and
    /// twice this value
    #[builder(default = DEFAULT_ELECTION_TICK)]
    pub election_tick: usize,

    /// Number of ticks between heartbeats of a leader
    #[builder(default = DEFAULT_HEARTBEAT_TICK)]
    pub heartbeat_tick: usize,

    #[builder(default, setter(strip_option))]
    pub storage: Option<S>,

    /// Last index already applied by the application on restart
    #[builder(default)]
    pub applied: u64,

    /// Seed of the timeout randomization; from entropy when not set
    #[builder(default, setter(strip_option))]
    pub seed: Option<u64>,
}

impl<S> Config<S> {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_none() {
            return Err(ConfigError::InvalidId);
        }
        if self.heartbeat_tick == 0 {
            return Err(ConfigError::HeartbeatTick);
        }
        if self.election_tick <= self.heartbeat_tick {
            return Err(ConfigError::ElectionTick);
        }
        if self.storage.is_none() {
            return Err(ConfigError::MissingStorage);
        }
        Ok(())
    }
}

#[test]
fn config_validation() {
    let config = |id, election_tick, heartbeat_tick| {
        Config::builder()
            .id(NodeId(id))
            .election_tick(election_tick)
            .heartbeat_tick(heartbeat_tick)
            .storage(())
            .build()
    };

    assert_eq!(config(1, 10, 1).validate(), Ok(()));
    assert_eq!(config(0, 10, 1).validate(), Err(ConfigError::InvalidId));
    assert_eq!(config(1, 10, 0).validate(), Err(ConfigError::HeartbeatTick));
    assert_eq!(config(1, 3, 3).validate(), Err(ConfigError::ElectionTick));
    assert_eq!(
        Config::<()>::builder().id(NodeId(1)).build().validate(),
        Err(ConfigError::MissingStorage)
    );
}

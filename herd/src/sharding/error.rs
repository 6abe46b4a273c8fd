use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("shard mapping ({0}) not found")]
    MappingNotFound(u64),

    #[error("table ({0}) has no shard mapping")]
    TableNotFound(String),

    #[error("table ({0}) is already attached to a shard mapping")]
    TableAlreadySharded(String),

    #[error("shards already exist in mapping ({0}); grow with split")]
    ShardsAlreadyExist(u64),

    #[error("mapping ({0}) still has tables attached")]
    TablesStillAttached(u64),

    #[error("lower bounds for HASH shards are derived, not supplied")]
    LowerBoundAutoGenerated,

    #[error("lower bound ({0}) is missing for a RANGE shard")]
    LowerBoundMissing(String),

    #[error("invalid lower bound value ({0})")]
    InvalidLowerBound(String),

    #[error("invalid key ({0})")]
    InvalidKey(String),

    #[error("invalid lookup hint ({0})")]
    InvalidHint(String),

    #[error("shard ({0}) not found")]
    ShardNotFound(u64),

    #[error("shard ({0}) is not enabled")]
    ShardNotEnabled(u64),

    #[error("shard ({0}) is not disabled")]
    ShardNotDisabled(u64),

    #[error("group ({0}) not found")]
    GroupNotFound(String),

    #[error("group ({0}) already hosts a shard")]
    DestinationNotEmpty(String),

    #[error("group ({0}) has no master")]
    MasterNotFound(String),

    #[error("invalid shard state ({0})")]
    InvalidState(String),

    #[error("a split value is required for RANGE shards")]
    SplitValueNotDefined,

    #[error("split values for HASH shards are computed, not supplied")]
    NoSplitValueForHash,

    #[error("invalid split value ({0}): must fall strictly inside the shard")]
    InvalidSplitValue(String),

    #[error("shard ({0}) has no rows to derive a split point from")]
    EmptyShard(u64),

    #[error("invalid sharding type ({0})")]
    InvalidType(String),
}

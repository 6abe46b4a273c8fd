//! State store DDL. Creation order satisfies the declared foreign keys;
//! drop order reverses it.

pub const BACKENDS: &str = "CREATE TABLE IF NOT EXISTS backends (
    uuid VARCHAR(40) NOT NULL,
    address VARCHAR(128) NOT NULL,
    user VARCHAR(64) NOT NULL,
    passwd TEXT,
    status VARCHAR(16) NOT NULL,
    mode VARCHAR(16) NOT NULL,
    weight FLOAT NOT NULL DEFAULT 1.0,
    PRIMARY KEY (uuid)
)";

// GROUPS is a reserved word in MySQL 8.0; the name stays quoted in every
// statement that touches the table.
pub const GROUPS: &str = "CREATE TABLE IF NOT EXISTS `groups` (
    id VARCHAR(64) NOT NULL,
    description VARCHAR(256),
    master_uuid VARCHAR(40),
    status BIT(1) NOT NULL DEFAULT 0,
    PRIMARY KEY (id)
)";

pub const GROUP_MEMBERS: &str = "CREATE TABLE IF NOT EXISTS group_members (
    group_id VARCHAR(64) NOT NULL,
    backend_uuid VARCHAR(40) NOT NULL,
    PRIMARY KEY (group_id, backend_uuid),
    CONSTRAINT fk_members_group FOREIGN KEY (group_id) REFERENCES `groups` (id),
    CONSTRAINT fk_members_backend FOREIGN KEY (backend_uuid) REFERENCES backends (uuid)
)";

pub const GLOBAL_TO_SHARD: &str = "CREATE TABLE IF NOT EXISTS global_to_shard (
    group_id VARCHAR(64) NOT NULL,
    master_group_id VARCHAR(64) NOT NULL,
    PRIMARY KEY (group_id),
    CONSTRAINT fk_gts_group FOREIGN KEY (group_id) REFERENCES `groups` (id),
    CONSTRAINT fk_gts_master FOREIGN KEY (master_group_id) REFERENCES `groups` (id)
)";

pub const SHARD_TO_GLOBAL: &str = "CREATE TABLE IF NOT EXISTS shard_to_global (
    group_id VARCHAR(64) NOT NULL,
    slave_group_id VARCHAR(64) NOT NULL,
    PRIMARY KEY (group_id, slave_group_id),
    UNIQUE KEY uq_stg_slave (slave_group_id),
    CONSTRAINT fk_stg_group FOREIGN KEY (group_id) REFERENCES `groups` (id),
    CONSTRAINT fk_stg_slave FOREIGN KEY (slave_group_id) REFERENCES `groups` (id)
)";

pub const SHARD_MAPS: &str = "CREATE TABLE IF NOT EXISTS shard_maps (
    id INT NOT NULL AUTO_INCREMENT,
    type ENUM('RANGE', 'HASH', 'RANGE_STRING', 'RANGE_DATETIME') NOT NULL,
    global_group VARCHAR(64) NOT NULL,
    PRIMARY KEY (id),
    CONSTRAINT fk_maps_global FOREIGN KEY (global_group) REFERENCES `groups` (id)
)";

pub const SHARD_TABLES: &str = "CREATE TABLE IF NOT EXISTS shard_tables (
    map_id INT NOT NULL,
    table_name VARCHAR(64) NOT NULL,
    column_name VARCHAR(64) NOT NULL,
    PRIMARY KEY (table_name, column_name),
    CONSTRAINT fk_tables_map FOREIGN KEY (map_id) REFERENCES shard_maps (id)
)";

pub const SHARDS: &str = "CREATE TABLE IF NOT EXISTS shards (
    id INT NOT NULL AUTO_INCREMENT,
    group_id VARCHAR(64) NOT NULL,
    state ENUM('ENABLED', 'DISABLED') NOT NULL,
    PRIMARY KEY (id),
    UNIQUE KEY uq_shards_group (group_id),
    CONSTRAINT fk_shards_group FOREIGN KEY (group_id) REFERENCES `groups` (id)
)";

pub const SHARD_RANGES: &str = "CREATE TABLE IF NOT EXISTS shard_ranges (
    map_id INT NOT NULL,
    lower_bound VARBINARY(128) NOT NULL,
    shard_id INT NOT NULL,
    UNIQUE KEY uq_ranges_bound (map_id, lower_bound),
    CONSTRAINT fk_ranges_map FOREIGN KEY (map_id) REFERENCES shard_maps (id),
    CONSTRAINT fk_ranges_shard FOREIGN KEY (shard_id) REFERENCES shards (id)
)";

/// Tables in foreign-key-safe creation order.
pub fn create_order() -> Vec<(&'static str, &'static str)> {
    vec![
        ("backends", BACKENDS),
        ("groups", GROUPS),
        ("group_members", GROUP_MEMBERS),
        ("global_to_shard", GLOBAL_TO_SHARD),
        ("shard_to_global", SHARD_TO_GLOBAL),
        ("shard_maps", SHARD_MAPS),
        ("shard_tables", SHARD_TABLES),
        ("shards", SHARDS),
        ("shard_ranges", SHARD_RANGES),
    ]
}

/// Tables in drop order (reverse of creation).
pub fn drop_order() -> Vec<&'static str> {
    create_order().into_iter().rev().map(|(name, _)| name).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_drop_reverses_create() {
        let create: Vec<_> = create_order().into_iter().map(|(n, _)| n).collect();
        let mut drop = drop_order();
        drop.reverse();
        assert_eq!(create, drop);
        assert_eq!(create.first(), Some(&"backends"));
        assert_eq!(create.last(), Some(&"shard_ranges"));
    }
}

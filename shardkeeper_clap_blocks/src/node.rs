//! Identity of the shard this process serves.

/// CLI config for the node.
#[derive(Debug, Clone, clap::Parser)]
pub struct NodeConfig {
    /// Identifier of the shard this node is a member of.
    #[clap(
        long = "shard-id",
        env = "SHARDKEEPER_SHARD_ID",
        default_value = "shard0",
        action
    )]
    pub shard_id: String,

    /// Replication term this node steps up in when it starts.
    ///
    /// Must be greater than the term of any primary that ran before it.
    #[clap(
        long = "initial-term",
        env = "SHARDKEEPER_INITIAL_TERM",
        default_value = "1",
        action
    )]
    pub initial_term: i64,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn defaults() {
        let config = NodeConfig::try_parse_from(["my_binary"]).unwrap();
        assert_eq!("shard0", config.shard_id);
        assert_eq!(1, config.initial_term);
    }

    #[test]
    fn term_must_be_a_number() {
        let error = NodeConfig::try_parse_from(["my_binary", "--initial-term", "two"])
            .unwrap_err()
            .to_string();
        assert!(error.contains("invalid value 'two'"), "{error}");
    }
}

use crate::attr::{Attribute, AttributeMap};

/// How an operator's output rows are laid out across partitions.
#[derive(Debug, Clone, PartialEq)]
pub enum Partitioning {
    /// Partition count known, layout otherwise unconstrained.
    Unknown {
        /// Output partition count, zero when not yet materialized.
        partitions: usize,
    },
    /// A single output partition.
    Single,
    /// Hash partitioned on `keys` into `partitions` partitions.
    HashKeys {
        /// Partition key attributes.
        keys: Vec<Attribute>,
        /// Partition count.
        partitions: usize,
    },
    /// Replicated to every consumer.
    Broadcast,
}

impl Partitioning {
    /// Output partition count under this layout.
    pub fn num_partitions(&self) -> usize {
        match self {
            Partitioning::Unknown { partitions } => *partitions,
            Partitioning::Single => 1,
            Partitioning::HashKeys { partitions, .. } => *partitions,
            Partitioning::Broadcast => 1,
        }
    }

    /// Rewrite key references through an attribute map.
    pub fn remap(&self, map: &AttributeMap) -> Self {
        match self {
            Partitioning::HashKeys { keys, partitions } => Partitioning::HashKeys {
                keys: map.map_all(keys),
                partitions: *partitions,
            },
            other => other.clone(),
        }
    }

    /// Whether this layout satisfies a required distribution.
    pub fn satisfies(&self, required: &Distribution) -> bool {
        match required {
            Distribution::Unspecified => true,
            Distribution::Single => matches!(self, Partitioning::Single),
            Distribution::Broadcast => matches!(self, Partitioning::Broadcast),
            Distribution::HashClustered(req) => match self {
                Partitioning::Single => true,
                Partitioning::HashKeys { keys, .. } => {
                    keys.len() == req.len()
                        && keys.iter().zip(req.iter()).all(|(k, r)| k.id == r.id)
                }
                _ => false,
            },
        }
    }
}

/// Row-distribution requirement an operator places on a child.
#[derive(Debug, Clone, PartialEq)]
pub enum Distribution {
    /// No requirement.
    Unspecified,
    /// Rows with equal values of the given keys must share a partition.
    HashClustered(Vec<Attribute>),
    /// The whole relation replicated to every task.
    Broadcast,
    /// The whole relation in one partition.
    Single,
}

/// One sort key of an operator's output ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct SortOrder {
    /// Sort key attribute.
    pub key: Attribute,
    /// Descending when true, ascending otherwise.
    pub descending: bool,
}

impl SortOrder {
    /// Ascending order on a key.
    pub fn asc(key: Attribute) -> Self {
        Self {
            key,
            descending: false,
        }
    }
}

/// Whether `actual` starts with the `required` ordering prefix.
pub fn ordering_satisfied(actual: &[SortOrder], required: &[SortOrder]) -> bool {
    required.len() <= actual.len()
        && required
            .iter()
            .zip(actual.iter())
            .all(|(r, a)| r.key.id == a.key.id && r.descending == a.descending)
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;

    use super::*;

    #[test]
    fn hash_layout_satisfies_matching_cluster() {
        let k = Attribute::new("k", DataType::Int64);
        let layout = Partitioning::HashKeys {
            keys: vec![k.clone()],
            partitions: 4,
        };
        assert!(layout.satisfies(&Distribution::HashClustered(vec![k.clone()])));
        assert!(!layout.satisfies(&Distribution::HashClustered(vec![
            Attribute::new("k", DataType::Int64)
        ])));
        assert!(!layout.satisfies(&Distribution::Broadcast));
    }

    #[test]
    fn single_partition_satisfies_any_clustering() {
        let k = Attribute::new("k", DataType::Int64);
        assert!(Partitioning::Single.satisfies(&Distribution::HashClustered(vec![k])));
    }

    #[test]
    fn ordering_prefix_check() {
        let a = Attribute::new("a", DataType::Int64);
        let b = Attribute::new("b", DataType::Int64);
        let actual = vec![SortOrder::asc(a.clone()), SortOrder::asc(b.clone())];
        assert!(ordering_satisfied(&actual, &[SortOrder::asc(a.clone())]));
        assert!(!ordering_satisfied(&actual, &[SortOrder::asc(b)]));
    }
}

//! The fluent transformation surface.
//!
//! Every method appends exactly the steps it documents and returns the
//! new terminal dataset. Property flags propagate truthfully: a step
//! that cannot guarantee a property clears it downstream.

use riffle_core::row::{ascending_on, indexes_of, OrderBy};
use riffle_shuffle::{DecodeErrorPolicy, JoinType};

use crate::flow::Dataset;
use crate::graph::{DatasetMeta, StepFunction, StepLayout};

/// An empty key list means "the leading column".
fn keys_or_first(indexes: &[usize]) -> Vec<usize> {
    if indexes.is_empty() {
        vec![1]
    } else {
        indexes.to_vec()
    }
}

impl Dataset {
    fn add_one_to_one(
        &self,
        name: &str,
        function: StepFunction,
        update: impl FnOnce(&DatasetMeta, &mut DatasetMeta),
    ) -> Dataset {
        let mut g = self.lock();
        let input_meta = g.dataset(self.id).clone();
        let (_, out) = g.add_step(
            name,
            vec![self.id],
            Some(input_meta.shard_count),
            StepLayout::OneToOne,
            false,
            function,
        );
        let out = out.expect("one-to-one step has an output dataset");
        update(&input_meta, g.dataset_mut(out));
        drop(g);
        self.sibling(out)
    }

    fn script_step(&self, name: &str, command: &str) -> Dataset {
        self.add_one_to_one(
            name,
            StepFunction::Script { command: command.to_string() },
            |input, out| {
                // User commands are trusted to leave key columns alone;
                // any ordering they see is incidental.
                out.partitioned_by = input.partitioned_by.clone();
            },
        )
    }

    /// One child process per shard mapping each input row to one output
    /// row, rows exchanged as tab-separated lines.
    pub fn map(&self, command: &str) -> Dataset {
        self.script_step("Map", command)
    }

    /// As [`map`](Self::map), but each input row may produce any number
    /// of output rows.
    pub fn flat_map(&self, command: &str) -> Dataset {
        self.script_step("FlatMap", command)
    }

    /// As [`map`](Self::map), keeping only the rows the command echoes
    /// back.
    pub fn filter(&self, command: &str) -> Dataset {
        self.script_step("Filter", command)
    }

    /// A bare user transform with no extra semantics attached.
    pub fn script(&self, command: &str) -> Dataset {
        self.script_step("Script", command)
    }

    /// One child process per shard over raw bytes. The output dataset is
    /// a pipe: downstream consumers see exactly the child's stdout.
    pub fn pipe(&self, command: &str) -> Dataset {
        self.add_one_to_one(
            "Pipe",
            StepFunction::Command { command: command.to_string() },
            |_, _| {},
        )
    }

    /// One shell invocation per input row, with `$1`..`$N` replaced by
    /// the row's fields. The output dataset is a pipe.
    pub fn pipe_as_args(&self, command: &str) -> Dataset {
        self.add_one_to_one(
            "PipeAsArgs",
            StepFunction::CommandPerRow { command: command.to_string() },
            |_, _| {},
        )
    }

    /// Sorts every shard in memory by the OrderBys. No-op when the
    /// dataset is already sorted exactly that way.
    pub fn local_sort(&self, order_bys: &[OrderBy]) -> Dataset {
        self.local_sort_with(order_bys, DecodeErrorPolicy::default())
    }

    /// [`local_sort`](Self::local_sort) with an explicit policy for rows
    /// whose keys fail to decode.
    pub fn local_sort_with(&self, order_bys: &[OrderBy], on_error: DecodeErrorPolicy) -> Dataset {
        if self.meta().local_sorted.as_deref() == Some(order_bys) {
            return self.clone();
        }
        self.add_one_to_one(
            "LocalSort",
            StepFunction::LocalSort { order_bys: order_bys.to_vec(), on_error },
            |input, out| {
                out.local_sorted = Some(order_bys.to_vec());
                out.partitioned_by = input.partitioned_by.clone();
            },
        )
    }

    /// Merges locally sorted shards down to `partition_count` shards,
    /// each fed by a run of consecutive input shards. No-op when the
    /// shard count already matches.
    pub fn merge_sorted_to(&self, partition_count: usize, order_bys: &[OrderBy]) -> Dataset {
        let input_meta = self.meta();
        if input_meta.shard_count == partition_count {
            return self.clone();
        }
        let every_n = input_meta.shard_count.div_ceil(partition_count);
        let mut g = self.lock();
        let (_, out) = g.add_step(
            format!("MergeSortedTo {}", partition_count),
            vec![self.id],
            Some(partition_count),
            StepLayout::LinkedNToOne { every_n },
            false,
            StepFunction::MergeSortedTo { order_bys: order_bys.to_vec() },
        );
        let out = out.expect("merge step has an output dataset");
        let meta = g.dataset_mut(out);
        meta.local_sorted = Some(order_bys.to_vec());
        // Merging moves rows between shards, so the partition property
        // only survives when it is the sort key itself.
        if input_meta.partitioned_by.as_deref() == Some(&indexes_of(order_bys)[..]) {
            meta.partitioned_by = input_meta.partitioned_by.clone();
        }
        drop(g);
        self.sibling(out)
    }

    /// Globally sorts by the given columns ascending: a local sort, then
    /// a merge to one shard when there are several.
    pub fn sort(&self, indexes: &[usize]) -> Dataset {
        self.sort_by(&ascending_on(&keys_or_first(indexes)))
    }

    /// Globally sorts by an explicit OrderBy sequence.
    pub fn sort_by(&self, order_bys: &[OrderBy]) -> Dataset {
        let sorted = self.local_sort(order_bys);
        if sorted.shard_count() > 1 {
            sorted.merge_sorted_to(1, order_bys)
        } else {
            sorted
        }
    }

    /// Re-partitions the dataset onto `partition_count` shards by the
    /// hash of the given key columns: a scatter step fanning each input
    /// shard out to `partition_count` channels, and a collect step
    /// gathering the matching channels of every input shard.
    pub fn partition_by_key(&self, partition_count: usize, indexes: &[usize]) -> Dataset {
        let indexes = keys_or_first(indexes);
        let input_meta = self.meta();
        if input_meta.partitioned_by.as_deref() == Some(&indexes[..])
            && input_meta.shard_count == partition_count
        {
            return self.clone();
        }
        if input_meta.shard_count == 1 && partition_count == 1 {
            // One shard trivially satisfies any partitioning.
            self.lock().dataset_mut(self.id).partitioned_by = Some(indexes);
            return self.clone();
        }

        let mut g = self.lock();
        let n = g.dataset(self.id).shard_count;
        let (_, scattered) = g.add_step(
            format!("ScatterPartitions {}", partition_count),
            vec![self.id],
            Some(n * partition_count),
            StepLayout::OneToEveryN { fan_out: partition_count },
            false,
            StepFunction::ScatterPartitions {
                indexes: indexes.clone(),
                partition_count,
            },
        );
        let scattered = scattered.expect("scatter step has an output dataset");
        let (_, collected) = g.add_step(
            "CollectPartitions",
            vec![scattered],
            Some(partition_count),
            StepLayout::StrideToOne { stride: partition_count },
            false,
            StepFunction::CollectPartitions,
        );
        let collected = collected.expect("collect step has an output dataset");
        g.dataset_mut(collected).partitioned_by = Some(indexes);
        drop(g);
        self.sibling(collected)
    }

    /// Groups adjacent equal-keyed rows into `(key…, [values])` after a
    /// local sort by the key columns.
    pub fn group_by_key(&self, indexes: &[usize]) -> Dataset {
        let order = ascending_on(&keys_or_first(indexes));
        let sorted = self.local_sort(&order);
        sorted.add_one_to_one(
            "GroupByKey",
            StepFunction::LocalGroupByKey { order_bys: order.clone() },
            |input, out| {
                out.local_sorted = Some(order.clone());
                out.partitioned_by = input.partitioned_by.clone();
            },
        )
    }

    /// Reduces equal-keyed rows with a user command that sees key-sorted
    /// tab-separated lines and must emit one line per key. With several
    /// shards the reduction runs twice: per shard, then once more after
    /// a merge to one shard.
    pub fn reduce_by_key(&self, command: &str, indexes: &[usize]) -> Dataset {
        let order = ascending_on(&keys_or_first(indexes));
        let mut reduced = self.local_sort(&order).reduce_step(command, &order);
        if reduced.shard_count() > 1 {
            reduced = reduced
                .merge_sorted_to(1, &order)
                .reduce_step(command, &order);
        }
        reduced
    }

    fn reduce_step(&self, command: &str, order: &[OrderBy]) -> Dataset {
        self.add_one_to_one(
            "ReduceByKey",
            StepFunction::Script { command: command.to_string() },
            |input, out| {
                // The reducer contract keeps input order per key, so the
                // sort survives it.
                out.local_sorted = Some(order.to_vec());
                out.partitioned_by = input.partitioned_by.clone();
            },
        )
    }

    /// Merge-joins two datasets on the given key columns. Both sides are
    /// brought to partitioned-sorted form first (onto the larger of the
    /// two shard counts), then joined pairwise per shard.
    pub fn join(&self, other: &Dataset, indexes: &[usize], join_type: JoinType) -> Dataset {
        self.binary_merge(other, indexes, |order_bys| {
            ("JoinPartitionedSorted", StepFunction::JoinPartitionedSorted { order_bys, join_type })
        })
    }

    /// As [`join`](Self::join), but emits one row per key seen on either
    /// side: `(key…, [left rows], [right rows])`.
    pub fn co_group(&self, other: &Dataset, indexes: &[usize]) -> Dataset {
        self.binary_merge(other, indexes, |order_bys| {
            ("CoGroupPartitionedSorted", StepFunction::CoGroupPartitionedSorted { order_bys })
        })
    }

    fn binary_merge(
        &self,
        other: &Dataset,
        indexes: &[usize],
        make: impl FnOnce(Vec<OrderBy>) -> (&'static str, StepFunction),
    ) -> Dataset {
        assert!(
            std::sync::Arc::ptr_eq(&self.graph, &other.graph),
            "joined datasets must belong to the same flow"
        );
        let indexes = keys_or_first(indexes);
        let order = ascending_on(&indexes);
        let partition_count = self.shard_count().max(other.shard_count());

        let left = self.partition_by_key(partition_count, &indexes).local_sort(&order);
        let right = other.partition_by_key(partition_count, &indexes).local_sort(&order);

        let (name, function) = make(order);
        let mut g = left.lock();
        let (_, out) = g.add_step(
            name,
            vec![left.id, right.id],
            Some(partition_count),
            StepLayout::Pairwise,
            false,
            function,
        );
        let out = out.expect("binary merge step has an output dataset");
        // Join output rows lead with the key columns.
        let out_keys: Vec<usize> = (1..=indexes.len()).collect();
        let meta = g.dataset_mut(out);
        meta.local_sorted = Some(ascending_on(&out_keys));
        meta.partitioned_by = Some(out_keys);
        drop(g);
        self.sibling(out)
    }
}

//! Fluent assembly of a [`Pipeline`]
//!
//! Stages follow the order the callbacks are needed in. Each callback has a
//! `try_` variant whose error is reported as a failure of its phase.
//!
//! ```no_run
//! use gated_mapreduce::MapReduce;
//!
//! let pipeline = MapReduce::with_input::<String>()
//!     .with_reader(|text: String| text.lines().map(str::to_string).collect::<Vec<_>>())
//!     .with_mapper(|line: String| {
//!         line.split(' ').map(|w| (w.to_string(), 1u64)).collect::<Vec<_>>()
//!     })
//!     .with_reducer(|_word, counts| counts.into_iter().sum())
//!     .with_default_writer()
//!     .build()
//!     .unwrap();
//! ```

use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::Phase;
use crate::execution::scheduler::{Scheduler, SchedulerConfig};
use crate::mapreduce::pipeline::{Callbacks, Comparer, Mapper, Pipeline, Reader, Reducer, Writer};
use crate::structures::concurrent_map::DEFAULT_BUCKET_COUNT;
use std::convert::Infallible;
use std::fmt::Display;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

/// Entry point of the builder
#[derive(Debug)]
pub struct MapReduce;

impl MapReduce {
    /// Start a job whose run input has type `I`
    pub fn with_input<I: 'static>() -> InputStage<I> {
        InputStage { _input: PhantomData }
    }
}

/// Input type chosen, reader pending
#[derive(Debug)]
pub struct InputStage<I> {
    _input: PhantomData<fn(I)>,
}

impl<I: 'static> InputStage<I> {
    /// Set the function splitting the input into records
    pub fn with_reader<D, R, F>(self, read: F) -> ReaderStage<I, D>
    where
        D: Send + 'static,
        R: IntoIterator<Item = D>,
        F: Fn(I) -> R + Send + Sync + 'static,
    {
        self.try_with_reader::<D, R, Infallible, _>(move |input: I| Ok(read(input)))
    }

    /// Set a fallible reader
    pub fn try_with_reader<D, R, E, F>(self, read: F) -> ReaderStage<I, D>
    where
        D: Send + 'static,
        R: IntoIterator<Item = D>,
        E: Display,
        F: Fn(I) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        ReaderStage {
            read: Box::new(move |input: I| -> Result<Vec<D>> {
                let records = read(input).map_err(failed_in(Phase::Read))?;
                Ok(records.into_iter().collect())
            }),
        }
    }

    /// Use the input's own items as records
    pub fn with_passthrough_reader(self) -> ReaderStage<I, I::Item>
    where
        I: IntoIterator,
        I::Item: Send + 'static,
    {
        self.with_reader(|input: I| input)
    }
}

/// Reader set, mapper pending
pub struct ReaderStage<I, D> {
    read: Reader<I, D>,
}

impl<I: 'static, D: Send + 'static> ReaderStage<I, D> {
    /// Set the function mapping one record to key/value pairs
    pub fn with_mapper<K, V, R, F>(self, map: F) -> PipelineBuilder<I, D, K, V>
    where
        K: Hash + Eq + Send + 'static,
        V: Send + 'static,
        R: IntoIterator<Item = (K, V)>,
        F: Fn(D) -> R + Send + Sync + 'static,
    {
        self.try_with_mapper::<K, V, R, Infallible, _>(move |record: D| Ok(map(record)))
    }

    /// Set a fallible mapper
    pub fn try_with_mapper<K, V, R, E, F>(self, map: F) -> PipelineBuilder<I, D, K, V>
    where
        K: Hash + Eq + Send + 'static,
        V: Send + 'static,
        R: IntoIterator<Item = (K, V)>,
        E: Display,
        F: Fn(D) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        let map: Mapper<D, K, V> = Arc::new(move |record: D| -> Result<Vec<(K, V)>> {
            let pairs = map(record).map_err(failed_in(Phase::Map))?;
            Ok(pairs.into_iter().collect())
        });
        PipelineBuilder {
            read: self.read,
            map,
            compare: None,
            reduce: None,
            write: None,
            scheduler: SchedulerConfig::default(),
            bucket_count: DEFAULT_BUCKET_COUNT,
        }
    }
}

/// Reader and mapper set; reducer and writer required before [`build`](PipelineBuilder::build)
pub struct PipelineBuilder<I, D, K, V> {
    read: Reader<I, D>,
    map: Mapper<D, K, V>,
    compare: Option<Comparer<K>>,
    reduce: Option<Reducer<K, V>>,
    write: Option<Writer<K, V>>,
    scheduler: SchedulerConfig,
    bucket_count: usize,
}

impl<I, D, K, V> PipelineBuilder<I, D, K, V>
where
    I: 'static,
    D: Send + 'static,
    K: Hash + Eq + Send + 'static,
    V: Send + 'static,
{
    /// Set a key comparer.
    ///
    /// The comparer is stored on the pipeline but grouping still relies on
    /// the key's `Hash` and `Eq`.
    pub fn with_comparer<F>(mut self, compare: F) -> Self
    where
        F: Fn(&K, &K) -> bool + Send + Sync + 'static,
    {
        self.compare = Some(Arc::new(compare));
        self
    }

    /// Set the function folding all values of a key into one
    pub fn with_reducer<F>(mut self, reduce: F) -> Self
    where
        F: Fn(&K, Vec<V>) -> V + Send + Sync + 'static,
    {
        self.try_with_reducer(move |key: &K, values: Vec<V>| Ok::<V, Infallible>(reduce(key, values)))
    }

    /// Set a fallible reducer
    pub fn try_with_reducer<E, F>(mut self, reduce: F) -> Self
    where
        E: Display,
        F: Fn(&K, Vec<V>) -> std::result::Result<V, E> + Send + Sync + 'static,
    {
        let reduce: Reducer<K, V> = Arc::new(move |key: &K, values: Vec<V>| -> Result<V> {
            reduce(key, values).map_err(failed_in(Phase::Reduce))
        });
        self.reduce = Some(reduce);
        self
    }

    /// Set the sink receiving each output pair
    pub fn with_writer<F>(self, write: F) -> Self
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        self.try_with_writer(move |key: &K, value: &V| {
            write(key, value);
            Ok::<(), Infallible>(())
        })
    }

    /// Set a fallible sink.
    ///
    /// A failed write is reported once the write phase has drained; the
    /// other pairs are still written.
    pub fn try_with_writer<E, F>(mut self, write: F) -> Self
    where
        E: Display,
        F: Fn(&K, &V) -> std::result::Result<(), E> + Send + Sync + 'static,
    {
        let write: Writer<K, V> = Arc::new(move |key: &K, value: &V| -> Result<()> {
            write(key, value).map_err(failed_in(Phase::Write))
        });
        self.write = Some(write);
        self
    }

    /// Use these scheduler settings for every phase
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Bucket count of the shuffle map
    pub fn with_bucket_count(mut self, bucket_count: usize) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    /// Take scheduler settings and bucket count from a loaded configuration
    pub fn with_config(self, config: &Config) -> Self {
        self.with_scheduler(config.scheduler.clone())
            .with_bucket_count(config.pipeline.bucket_count)
    }

    /// Finish the pipeline.
    ///
    /// Fails with a configuration error when the reducer or the writer is
    /// missing, or the bucket count is zero.
    pub fn build(self) -> Result<Pipeline<I, D, K, V>> {
        let reduce = self.reduce.ok_or_else(|| Error::config("Reducer cannot be missing"))?;

        if self.bucket_count == 0 {
            return Err(Error::config("Bucket count must be at least 1"));
        }

        let write = self
            .write
            .ok_or_else(|| Error::config("Writer cannot be missing; use with_default_writer to print pairs"))?;

        let compare: Comparer<K> = match self.compare {
            Some(compare) => {
                warn!("custom key comparer supplied; grouping still uses the key's Hash and Eq");
                compare
            }
            None => Arc::new(|a: &K, b: &K| a == b),
        };

        let callbacks = Callbacks { read: self.read, map: self.map, compare, reduce, write };
        Ok(Pipeline::from_parts(callbacks, Scheduler::new(self.scheduler), self.bucket_count))
    }
}

impl<I, D, K, V> PipelineBuilder<I, D, K, V>
where
    I: 'static,
    D: Send + 'static,
    K: Hash + Eq + Display + Send + 'static,
    V: Display + Send + 'static,
{
    /// Print every output pair as `Key: {k} | Value: {v}`
    pub fn with_default_writer(self) -> Self {
        self.with_writer(|key: &K, value: &V| println!("{}", default_line(key, value)))
    }
}

fn default_line(key: &impl Display, value: &impl Display) -> String {
    format!("Key: {} | Value: {}", key, value)
}

/// Tag a callback's own error with the phase it failed in
fn failed_in<E: Display>(phase: Phase) -> impl Fn(E) -> Error {
    move |e| Error::callback(phase, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_writer_line_format() {
        assert_eq!(default_line(&"Car", &1500), "Key: Car | Value: 1500");
        assert_eq!(default_line(&'a', &0.5), "Key: a | Value: 0.5");
    }

    #[test]
    fn missing_writer_fails_at_build() {
        let err = MapReduce::with_input::<Vec<u32>>()
            .with_passthrough_reader()
            .with_mapper(|n: u32| vec![(n, n)])
            .with_reducer(|_k, v| v.into_iter().sum())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("Writer"));
    }

    #[test]
    fn default_writer_builds_for_displayable_pairs() {
        let pipeline = MapReduce::with_input::<Vec<u32>>()
            .with_passthrough_reader()
            .with_mapper(|n: u32| vec![(n, n)])
            .with_reducer(|_k, v| v.into_iter().sum())
            .with_default_writer()
            .build()
            .unwrap();
        let summary = pipeline.run_blocking(vec![1, 2], 1).unwrap();
        assert_eq!(summary.outputs, 2);
    }

    #[test]
    fn callback_errors_are_tagged_with_their_phase() {
        let err = failed_in::<&str>(Phase::Reduce)("no values");
        assert_eq!(err.phase(), Some(Phase::Reduce));
        assert!(err.to_string().contains("no values"));
    }
}

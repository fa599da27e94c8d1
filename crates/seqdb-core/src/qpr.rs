//! Query Partial Results
//!
//! A `Qpr` is the result of running a query against one fraction (or one
//! replica). Partial results merge associatively, so the routing layer can
//! combine them in any grouping: ids keep global `(MID, RID)` order and are
//! truncated to the limit, histograms and totals add up, aggregation samples
//! merge bin-wise, and per-shard errors accumulate into `errors` (a partial
//! response, not a failure).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{Mid, SeqId};

/// Order in which documents are returned: newest-first is the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocsOrder {
    #[default]
    Desc,
    Asc,
}

impl DocsOrder {
    pub fn is_desc(self) -> bool {
        self == DocsOrder::Desc
    }

    /// True when LID iterators must advance in reverse (oldest-first output).
    pub fn is_reverse(self) -> bool {
        self == DocsOrder::Asc
    }
}

/// A found document id plus the shard it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdSource {
    pub id: SeqId,
    pub source: u64,
    #[serde(default)]
    pub hint: String,
}

/// An error contributed by one shard to a merged (partial) result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSource {
    pub err: String,
    pub source: u64,
}

/// Query partial result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Qpr {
    pub ids: Vec<IdSource>,
    pub histogram: HashMap<Mid, u64>,
    pub aggs: Vec<AggSamples>,
    pub total: u64,
    pub errors: Vec<ErrorSource>,
}

impl Qpr {
    /// Merge `other` into `self`. `limit` bounds the merged id list; `order`
    /// selects which end survives truncation.
    pub fn merge(&mut self, mut other: Qpr, limit: usize, order: DocsOrder) {
        let mut merged = Vec::with_capacity(self.ids.len() + other.ids.len());
        {
            let mut left = self.ids.drain(..).peekable();
            let mut right = other.ids.drain(..).peekable();
            while let (Some(a), Some(b)) = (left.peek(), right.peek()) {
                let take_left = match order {
                    DocsOrder::Desc => a.id >= b.id,
                    DocsOrder::Asc => a.id <= b.id,
                };
                let next = if take_left {
                    left.next()
                } else {
                    right.next()
                };
                push_dedup(&mut merged, next.unwrap());
            }
            for rest in left.chain(right) {
                push_dedup(&mut merged, rest);
            }
        }
        merged.truncate(limit);
        self.ids = merged;

        for (mid, count) in other.histogram {
            *self.histogram.entry(mid).or_insert(0) += count;
        }

        if self.aggs.is_empty() {
            self.aggs = other.aggs;
        } else {
            for (dst, src) in self.aggs.iter_mut().zip(other.aggs) {
                dst.merge(src);
            }
        }

        self.total += other.total;
        self.errors.extend(other.errors);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Stamp every id with the name of the fraction that produced it.
    pub fn apply_hint(&mut self, hint: &str) {
        for id in &mut self.ids {
            id.hint = hint.to_string();
        }
    }
}

fn push_dedup(dst: &mut Vec<IdSource>, id: IdSource) {
    if let Some(last) = dst.last() {
        if last.id == id.id {
            return;
        }
    }
    dst.push(id);
}

/// Aggregation functions supported by `Agg` queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    Quantile,
    Unique,
}

/// Aggregation bin key: a token value, optionally per-MID for time series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggBin {
    pub mid: Mid,
    pub token: String,
}

/// Samples collected for one bin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Samples {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    /// Raw values, kept only when a quantile was requested.
    pub values: Vec<f64>,
}

impl Samples {
    pub fn observe(&mut self, value: f64, keep_value: bool) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        if keep_value {
            self.values.push(value);
        }
    }

    pub fn merge(&mut self, other: &Samples) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            self.min = other.min;
            self.max = other.max;
        } else {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
        self.count += other.count;
        self.sum += other.sum;
        self.values.extend_from_slice(&other.values);
    }
}

/// Aggregatable samples for one `Agg` query over one shard. The bins map
/// round-trips through JSON as a pair list, since JSON map keys must be
/// strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggSamples {
    #[serde(with = "bins_as_pairs")]
    pub bins: HashMap<AggBin, Samples>,
    pub not_exists: i64,
}

mod bins_as_pairs {
    use super::{AggBin, Samples};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    pub fn serialize<S: Serializer>(
        bins: &HashMap<AggBin, Samples>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(&AggBin, &Samples)> = bins.iter().collect();
        pairs.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<HashMap<AggBin, Samples>, D::Error> {
        let pairs: Vec<(AggBin, Samples)> = Vec::deserialize(d)?;
        Ok(pairs.into_iter().collect())
    }
}

impl AggSamples {
    pub fn merge(&mut self, other: AggSamples) {
        for (bin, samples) in other.bins {
            self.bins.entry(bin).or_default().merge(&samples);
        }
        self.not_exists += other.not_exists;
    }

    /// Reduce the samples into sorted buckets for the given function.
    pub fn aggregate(&self, func: AggFunc, quantiles: &[f64]) -> AggResult {
        let mut buckets: Vec<AggBucket> = self
            .bins
            .iter()
            .map(|(bin, s)| {
                let (value, qs) = match func {
                    AggFunc::Count | AggFunc::Unique => (s.count as f64, Vec::new()),
                    AggFunc::Sum => (s.sum, Vec::new()),
                    AggFunc::Min => (s.min, Vec::new()),
                    AggFunc::Max => (s.max, Vec::new()),
                    AggFunc::Avg => {
                        let avg = if s.count > 0 {
                            s.sum / s.count as f64
                        } else {
                            0.0
                        };
                        (avg, Vec::new())
                    }
                    AggFunc::Quantile => {
                        let mut sorted = s.values.clone();
                        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                        let qs = quantiles
                            .iter()
                            .map(|&q| quantile_of(&sorted, q))
                            .collect::<Vec<_>>();
                        (qs.first().copied().unwrap_or(0.0), qs)
                    }
                };
                AggBucket {
                    name: bin.token.clone(),
                    mid: bin.mid,
                    value,
                    quantiles: qs,
                }
            })
            .collect();

        sort_buckets(func, &mut buckets);
        AggResult {
            buckets,
            not_exists: self.not_exists,
        }
    }
}

fn quantile_of(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn sort_buckets(func: AggFunc, buckets: &mut [AggBucket]) {
    match func {
        // MIN results read best ascending
        AggFunc::Min => buckets.sort_by(|a, b| {
            a.mid
                .cmp(&b.mid)
                .then(a.value.partial_cmp(&b.value).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.name.cmp(&b.name))
        }),
        AggFunc::Quantile => buckets.sort_by(|a, b| {
            a.mid
                .cmp(&b.mid)
                .then_with(|| a.name.cmp(&b.name))
                .then(b.value.partial_cmp(&a.value).unwrap_or(std::cmp::Ordering::Equal))
        }),
        _ => buckets.sort_by(|a, b| {
            a.mid
                .cmp(&b.mid)
                .then(b.value.partial_cmp(&a.value).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.name.cmp(&b.name))
        }),
    }
}

/// Final buckets of one aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggResult {
    pub buckets: Vec<AggBucket>,
    pub not_exists: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggBucket {
    pub name: String,
    pub mid: Mid,
    pub value: f64,
    pub quantiles: Vec<f64>,
}

/// Status of a long-running async search. Merging across replicas picks the
/// status with the greatest weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsyncSearchStatus {
    Done,
    InProgress,
    Canceled,
    Error,
}

impl AsyncSearchStatus {
    pub fn weight(self) -> u8 {
        match self {
            AsyncSearchStatus::Done => 1,
            AsyncSearchStatus::InProgress => 2,
            AsyncSearchStatus::Canceled => 3,
            AsyncSearchStatus::Error => 4,
        }
    }

    pub fn merge(self, other: AsyncSearchStatus) -> AsyncSearchStatus {
        if other.weight() > self.weight() {
            other
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(pairs: &[(u64, u64)]) -> Vec<IdSource> {
        pairs
            .iter()
            .map(|&(mid, rid)| IdSource {
                id: SeqId::new(mid, rid),
                source: 0,
                hint: String::new(),
            })
            .collect()
    }

    #[test]
    fn test_merge_desc_order() {
        let mut a = Qpr {
            ids: ids(&[(30, 0), (10, 0)]),
            total: 2,
            ..Default::default()
        };
        let b = Qpr {
            ids: ids(&[(40, 0), (20, 0)]),
            total: 2,
            ..Default::default()
        };
        a.merge(b, 10, DocsOrder::Desc);

        let mids: Vec<u64> = a.ids.iter().map(|i| i.id.mid).collect();
        assert_eq!(mids, vec![40, 30, 20, 10]);
        assert_eq!(a.total, 4);
    }

    #[test]
    fn test_merge_asc_order() {
        let mut a = Qpr {
            ids: ids(&[(10, 0), (30, 0)]),
            ..Default::default()
        };
        let b = Qpr {
            ids: ids(&[(20, 0), (40, 0)]),
            ..Default::default()
        };
        a.merge(b, 10, DocsOrder::Asc);

        let mids: Vec<u64> = a.ids.iter().map(|i| i.id.mid).collect();
        assert_eq!(mids, vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_merge_truncates_to_limit() {
        let mut a = Qpr {
            ids: ids(&[(5, 0), (4, 0), (3, 0)]),
            ..Default::default()
        };
        let b = Qpr {
            ids: ids(&[(6, 0), (2, 0)]),
            ..Default::default()
        };
        a.merge(b, 3, DocsOrder::Desc);

        let mids: Vec<u64> = a.ids.iter().map(|i| i.id.mid).collect();
        assert_eq!(mids, vec![6, 5, 4]);
    }

    #[test]
    fn test_merge_dedups_equal_ids() {
        let mut a = Qpr {
            ids: ids(&[(10, 7)]),
            ..Default::default()
        };
        let b = Qpr {
            ids: ids(&[(10, 7)]),
            ..Default::default()
        };
        a.merge(b, 10, DocsOrder::Desc);
        assert_eq!(a.ids.len(), 1);
    }

    #[test]
    fn test_merge_is_associative() {
        let make = |mids: &[u64]| Qpr {
            ids: ids(&mids.iter().map(|&m| (m, 0)).collect::<Vec<_>>()),
            total: mids.len() as u64,
            ..Default::default()
        };

        let mut left = make(&[50, 20]);
        left.merge(make(&[40, 10]), 100, DocsOrder::Desc);
        left.merge(make(&[30]), 100, DocsOrder::Desc);

        let mut right_inner = make(&[40, 10]);
        right_inner.merge(make(&[30]), 100, DocsOrder::Desc);
        let mut right = make(&[50, 20]);
        right.merge(right_inner, 100, DocsOrder::Desc);

        let l: Vec<u64> = left.ids.iter().map(|i| i.id.mid).collect();
        let r: Vec<u64> = right.ids.iter().map(|i| i.id.mid).collect();
        assert_eq!(l, r);
        assert_eq!(left.total, right.total);
    }

    #[test]
    fn test_merge_histograms() {
        let mut a = Qpr::default();
        a.histogram.insert(100, 2);
        let mut b = Qpr::default();
        b.histogram.insert(100, 3);
        b.histogram.insert(200, 1);
        a.merge(b, 10, DocsOrder::Desc);

        assert_eq!(a.histogram[&100], 5);
        assert_eq!(a.histogram[&200], 1);
    }

    #[test]
    fn test_merge_collects_errors() {
        let mut a = Qpr::default();
        let b = Qpr {
            errors: vec![ErrorSource {
                err: "shard down".to_string(),
                source: 3,
            }],
            ..Default::default()
        };
        a.merge(b, 10, DocsOrder::Desc);
        assert!(a.has_errors());
    }

    #[test]
    fn test_agg_count_buckets_sorted_desc() {
        let mut samples = AggSamples::default();
        for (token, n) in [("x0", 3), ("x1", 5), ("x2", 1)] {
            for _ in 0..n {
                samples
                    .bins
                    .entry(AggBin {
                        mid: 0,
                        token: token.to_string(),
                    })
                    .or_default()
                    .observe(1.0, false);
            }
        }
        let result = samples.aggregate(AggFunc::Count, &[]);
        let names: Vec<&str> = result.buckets.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["x1", "x0", "x2"]);
    }

    #[test]
    fn test_agg_min_sorted_asc() {
        let mut samples = AggSamples::default();
        for (token, v) in [("a", 9.0), ("b", 1.0)] {
            samples
                .bins
                .entry(AggBin {
                    mid: 0,
                    token: token.to_string(),
                })
                .or_default()
                .observe(v, false);
        }
        let result = samples.aggregate(AggFunc::Min, &[]);
        let names: Vec<&str> = result.buckets.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_agg_quantile() {
        let mut s = Samples::default();
        for v in 1..=100 {
            s.observe(v as f64, true);
        }
        let mut samples = AggSamples::default();
        samples.bins.insert(
            AggBin {
                mid: 0,
                token: "lat".to_string(),
            },
            s,
        );
        let result = samples.aggregate(AggFunc::Quantile, &[0.5, 0.99]);
        let bucket = &result.buckets[0];
        assert!((bucket.quantiles[0] - 50.0).abs() <= 1.0);
        assert!((bucket.quantiles[1] - 99.0).abs() <= 1.0);
    }

    #[test]
    fn test_samples_merge() {
        let mut a = Samples::default();
        a.observe(5.0, false);
        a.observe(1.0, false);
        let mut b = Samples::default();
        b.observe(10.0, false);

        a.merge(&b);
        assert_eq!(a.count, 3);
        assert_eq!(a.min, 1.0);
        assert_eq!(a.max, 10.0);
        assert_eq!(a.sum, 16.0);
    }

    #[test]
    fn test_status_merge_max_weight_wins() {
        use AsyncSearchStatus::*;
        assert_eq!(Done.merge(InProgress), InProgress);
        assert_eq!(InProgress.merge(Done), InProgress);
        assert_eq!(InProgress.merge(Canceled), Canceled);
        assert_eq!(Canceled.merge(Error), Error);
        assert_eq!(Error.merge(Done), Error);
    }
}

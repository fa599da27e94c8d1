//! Search and Fetch Processor
//!
//! Runs a query expression against any fraction through two narrow traits:
//! [`FracSearchIndex`] (token resolution + LID iteration + id lookups) and
//! [`FracFetchIndex`] (id -> LID -> document resolution). The processor is
//! the same for active, sealed and remote fractions; what differs is whether
//! the index is *ordered by id*:
//!
//! - Sealed fractions assign LIDs in `(MID, RID)`-descending order, so the
//!   LID stream already is the output order, time bounds become a LID range,
//!   and iteration stops as soon as `limit` ids are collected.
//! - The active fraction assigns LIDs in arrival order; the processor
//!   filters by MID per document, collects every match, and sorts at the
//!   end.
//!
//! Boolean operators (`or` / `and` / `not`) merge strictly-monotone LID
//! streams; cancellation is checked at every step.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use seqdb_core::qpr::{AggBin, AggFunc, AggSamples, IdSource};
use seqdb_core::query::{Query, TokenExpr};
use seqdb_core::{DocPos, DocsOrder, Error, Lid, Mid, Qpr, Result, Rid, SeqId};

use crate::context::SearchContext;

/// One aggregation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggQuery {
    pub field: String,
    pub func: AggFunc,
    #[serde(default)]
    pub quantiles: Vec<f64>,
}

/// Search request against one fraction (or fanned out across many).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: Query,
    pub from: Mid,
    pub to: Mid,
    pub limit: usize,
    #[serde(default)]
    pub with_total: bool,
    #[serde(default)]
    pub order: DocsOrder,
    /// Histogram bucket width in milliseconds; 0 disables the histogram.
    #[serde(default)]
    pub hist_interval: u64,
    #[serde(default)]
    pub aggs: Vec<AggQuery>,
}

impl SearchParams {
    pub fn new(query: Query) -> Self {
        SearchParams {
            query,
            from: 0,
            to: u64::MAX,
            limit: 100,
            with_total: false,
            order: DocsOrder::Desc,
            hist_interval: 0,
            aggs: Vec::new(),
        }
    }

    fn needs_full_scan(&self) -> bool {
        self.with_total || self.hist_interval > 0 || !self.aggs.is_empty()
    }
}

/// A strictly monotone stream of LIDs (ascending, or descending in reverse
/// mode).
pub trait LidIter {
    fn next(&mut self) -> Result<Option<Lid>>;
}

/// Search surface of one fraction.
pub trait FracSearchIndex {
    /// Number of documents (dense LIDs `1..=ids_total`).
    fn ids_total(&self) -> u32;

    /// LIDs are assigned in `(MID, RID)`-descending order.
    fn ordered_by_id(&self) -> bool;

    fn mid(&self, lid: Lid) -> Result<Mid>;

    fn rid(&self, lid: Lid) -> Result<Rid>;

    /// Resolve a token expression to TIDs, in value order for ordered
    /// fractions.
    fn tids_by_expr(&self, ctx: &SearchContext, expr: &TokenExpr) -> Result<Vec<u32>>;

    /// Per-TID posting-list iterators, bounded to `[min_lid, max_lid]`,
    /// advancing descending when `reverse`.
    fn lid_iters<'a>(
        &'a self,
        tids: &[u32],
        min_lid: Lid,
        max_lid: Lid,
        reverse: bool,
    ) -> Result<Vec<Box<dyn LidIter + 'a>>>;

    /// All `(tid, value)` tokens of a field, for aggregations.
    fn field_tokens(&self, ctx: &SearchContext, field: &str) -> Result<Vec<(u32, Vec<u8>)>>;
}

/// Fetch surface of one fraction.
pub trait FracFetchIndex {
    /// LID for each id; 0 when the id is not present.
    fn find_lids(&self, ctx: &SearchContext, ids: &[SeqId]) -> Result<Vec<Lid>>;

    fn doc_pos(&self, lid: Lid) -> Result<DocPos>;

    /// Read documents out of one docs block by intra-block offsets.
    fn read_docs(&self, block_index: u32, doc_offsets: &[u32]) -> Result<Vec<Vec<u8>>>;
}

/// Run a search against one fraction.
pub fn search(
    index: &dyn FracSearchIndex,
    params: &SearchParams,
    ctx: &SearchContext,
    source: u64,
) -> Result<Qpr> {
    let total_docs = index.ids_total();
    if total_docs == 0 || params.from > params.to {
        return Ok(Qpr::default());
    }

    let ordered = index.ordered_by_id();
    let reverse = params.order.is_reverse();

    let (min_lid, max_lid) = if ordered {
        match lid_bounds(index, params.from, params.to)? {
            Some(bounds) => bounds,
            None => return Ok(Qpr::default()),
        }
    } else {
        (1, total_docs)
    };

    let mut iter = eval(index, &params.query, ctx, min_lid, max_lid, reverse)?;

    let needs_full = params.needs_full_scan() || !ordered;
    let mut matched: Vec<Lid> = Vec::new();
    loop {
        ctx.check()?;
        let Some(lid) = iter.next()? else { break };
        if !ordered {
            let mid = index.mid(lid)?;
            if mid < params.from || mid > params.to {
                continue;
            }
        }
        matched.push(lid);
        if !needs_full && matched.len() >= params.limit {
            break;
        }
    }

    let mut qpr = Qpr {
        total: matched.len() as u64,
        ..Default::default()
    };

    // resolve ids; for unordered fractions the output order comes from a sort
    let mut id_lids: Vec<(SeqId, Lid)> = Vec::with_capacity(matched.len().min(params.limit));
    if ordered {
        for &lid in matched.iter().take(params.limit) {
            id_lids.push((SeqId::new(index.mid(lid)?, index.rid(lid)?), lid));
        }
    } else {
        let mut all: Vec<(SeqId, Lid)> = Vec::with_capacity(matched.len());
        for &lid in &matched {
            all.push((SeqId::new(index.mid(lid)?, index.rid(lid)?), lid));
        }
        match params.order {
            DocsOrder::Desc => all.sort_by(|a, b| b.0.cmp(&a.0)),
            DocsOrder::Asc => all.sort_by(|a, b| a.0.cmp(&b.0)),
        }
        all.truncate(params.limit);
        id_lids = all;
    }

    qpr.ids = id_lids
        .iter()
        .map(|&(id, _)| IdSource {
            id,
            source,
            hint: String::new(),
        })
        .collect();

    if params.hist_interval > 0 {
        for &lid in &matched {
            ctx.check()?;
            let mid = index.mid(lid)?;
            let bucket = mid - mid % params.hist_interval;
            *qpr.histogram.entry(bucket).or_insert(0) += 1;
        }
    }

    if !params.aggs.is_empty() {
        let matched_set: HashSet<Lid> = matched.iter().copied().collect();
        for agg in &params.aggs {
            qpr.aggs.push(collect_agg(
                index,
                ctx,
                agg,
                &matched_set,
                min_lid,
                max_lid,
            )?);
        }
    }

    Ok(qpr)
}

/// Fetch a batch of documents by id; a missing id yields an empty payload at
/// its position.
pub fn fetch(
    index: &dyn FracFetchIndex,
    ids: &[SeqId],
    ctx: &SearchContext,
) -> Result<Vec<Vec<u8>>> {
    let lids = index.find_lids(ctx, ids)?;
    if lids.len() != ids.len() {
        return Err(Error::corrupted("find_lids result length mismatch"));
    }

    // group positions by docs block so each block is read once
    let mut by_block: HashMap<u32, Vec<(usize, u32)>> = HashMap::new();
    for (i, &lid) in lids.iter().enumerate() {
        if lid == 0 {
            continue;
        }
        let pos = index.doc_pos(lid)?;
        if pos.is_not_found() {
            continue;
        }
        by_block
            .entry(pos.block_index())
            .or_default()
            .push((i, pos.offset()));
    }

    let mut result = vec![Vec::new(); ids.len()];
    for (block_index, entries) in by_block {
        ctx.check()?;
        let offsets: Vec<u32> = entries.iter().map(|&(_, off)| off).collect();
        let docs = index.read_docs(block_index, &offsets)?;
        for ((slot, _), doc) in entries.into_iter().zip(docs) {
            result[slot] = doc;
        }
    }
    Ok(result)
}

/// Translate a MID range into a LID range for an id-ordered fraction.
/// MIDs are non-increasing in LID, so both bounds are binary searches.
fn lid_bounds(
    index: &dyn FracSearchIndex,
    from: Mid,
    to: Mid,
) -> Result<Option<(Lid, Lid)>> {
    let n = index.ids_total();

    // first lid with mid <= to
    let mut lo = 1u32;
    let mut hi = n + 1;
    while lo < hi {
        let mid_lid = (lo + hi) / 2;
        if index.mid(mid_lid)? <= to {
            hi = mid_lid;
        } else {
            lo = mid_lid + 1;
        }
    }
    let min_lid = lo;
    if min_lid > n {
        return Ok(None);
    }

    // last lid with mid >= from
    let mut lo = min_lid;
    let mut hi = n + 1;
    while lo < hi {
        let mid_lid = (lo + hi) / 2;
        if index.mid(mid_lid)? >= from {
            lo = mid_lid + 1;
        } else {
            hi = mid_lid;
        }
    }
    if lo <= min_lid {
        return Ok(None);
    }
    Ok(Some((min_lid, lo - 1)))
}

fn eval<'a>(
    index: &'a dyn FracSearchIndex,
    query: &Query,
    ctx: &SearchContext,
    min_lid: Lid,
    max_lid: Lid,
    reverse: bool,
) -> Result<Box<dyn LidIter + 'a>> {
    match query {
        Query::Token(expr) => {
            let tids = index.tids_by_expr(ctx, expr)?;
            let iters = index.lid_iters(&tids, min_lid, max_lid, reverse)?;
            Ok(Box::new(OrIter::new(iters, reverse)))
        }
        Query::Or(a, b) => {
            let left = eval(index, a, ctx, min_lid, max_lid, reverse)?;
            let right = eval(index, b, ctx, min_lid, max_lid, reverse)?;
            Ok(Box::new(OrIter::new(vec![left, right], reverse)))
        }
        Query::And(a, b) => {
            let left = eval(index, a, ctx, min_lid, max_lid, reverse)?;
            let right = eval(index, b, ctx, min_lid, max_lid, reverse)?;
            Ok(Box::new(AndIter {
                left,
                right,
                reverse,
            }))
        }
        Query::Not(inner) => {
            let stream = eval(index, inner, ctx, min_lid, max_lid, reverse)?;
            Ok(Box::new(NotIter::new(stream, min_lid, max_lid, reverse)))
        }
    }
}

fn collect_agg(
    index: &dyn FracSearchIndex,
    ctx: &SearchContext,
    agg: &AggQuery,
    matched: &HashSet<Lid>,
    min_lid: Lid,
    max_lid: Lid,
) -> Result<AggSamples> {
    let keep_values = agg.func == AggFunc::Quantile;
    let mut samples = AggSamples::default();
    let mut docs_with_field: HashSet<Lid> = HashSet::new();

    for (tid, value) in index.field_tokens(ctx, &agg.field)? {
        ctx.check()?;
        let token = String::from_utf8_lossy(&value).into_owned();
        let numeric: Option<f64> = token.parse().ok();

        let mut iters = index.lid_iters(&[tid], min_lid, max_lid, false)?;
        let iter = &mut iters[0];
        let mut hits = 0u64;
        while let Some(lid) = iter.next()? {
            if !matched.contains(&lid) {
                continue;
            }
            hits += 1;
            docs_with_field.insert(lid);
        }
        if hits == 0 {
            continue;
        }

        let bin = AggBin { mid: 0, token };
        let entry = samples.bins.entry(bin).or_default();
        match agg.func {
            AggFunc::Count => {
                for _ in 0..hits {
                    entry.observe(1.0, false);
                }
            }
            AggFunc::Unique => entry.observe(1.0, false),
            _ => {
                let value = numeric.unwrap_or(0.0);
                for _ in 0..hits {
                    entry.observe(value, keep_values);
                }
            }
        }
    }

    samples.not_exists = matched.len() as i64 - docs_with_field.len() as i64;
    Ok(samples)
}

// --- operators -------------------------------------------------------------

/// k-way union of monotone streams, with duplicate elimination.
struct OrIter<'a> {
    iters: Vec<Box<dyn LidIter + 'a>>,
    heads: Vec<Option<Lid>>,
    reverse: bool,
    primed: bool,
}

impl<'a> OrIter<'a> {
    fn new(iters: Vec<Box<dyn LidIter + 'a>>, reverse: bool) -> Self {
        let heads = vec![None; iters.len()];
        OrIter {
            iters,
            heads,
            reverse,
            primed: false,
        }
    }
}

impl LidIter for OrIter<'_> {
    fn next(&mut self) -> Result<Option<Lid>> {
        if !self.primed {
            for (i, iter) in self.iters.iter_mut().enumerate() {
                self.heads[i] = iter.next()?;
            }
            self.primed = true;
        }

        let best = if self.reverse {
            self.heads.iter().flatten().copied().max()
        } else {
            self.heads.iter().flatten().copied().min()
        };
        let Some(best) = best else { return Ok(None) };

        for (i, head) in self.heads.iter_mut().enumerate() {
            if *head == Some(best) {
                *head = self.iters[i].next()?;
            }
        }
        Ok(Some(best))
    }
}

/// Intersection of two monotone streams.
struct AndIter<'a> {
    left: Box<dyn LidIter + 'a>,
    right: Box<dyn LidIter + 'a>,
    reverse: bool,
}

impl LidIter for AndIter<'_> {
    fn next(&mut self) -> Result<Option<Lid>> {
        let mut a = self.left.next()?;
        let mut b = self.right.next()?;
        loop {
            let (Some(va), Some(vb)) = (a, b) else {
                return Ok(None);
            };
            if va == vb {
                return Ok(Some(va));
            }
            let advance_left = if self.reverse { va > vb } else { va < vb };
            if advance_left {
                a = self.left.next()?;
            } else {
                b = self.right.next()?;
            }
        }
    }
}

/// Complement of a stream against the dense LID range `[min_lid, max_lid]`.
struct NotIter<'a> {
    stream: Box<dyn LidIter + 'a>,
    head: Option<Lid>,
    current: u64, // next candidate; u64 to survive the last decrement
    min_lid: Lid,
    max_lid: Lid,
    reverse: bool,
    primed: bool,
}

impl<'a> NotIter<'a> {
    fn new(stream: Box<dyn LidIter + 'a>, min_lid: Lid, max_lid: Lid, reverse: bool) -> Self {
        let current = if reverse {
            max_lid as u64
        } else {
            min_lid as u64
        };
        NotIter {
            stream,
            head: None,
            current,
            min_lid,
            max_lid,
            reverse,
            primed: false,
        }
    }
}

impl LidIter for NotIter<'_> {
    fn next(&mut self) -> Result<Option<Lid>> {
        if !self.primed {
            self.head = self.stream.next()?;
            self.primed = true;
        }
        loop {
            let in_range = if self.reverse {
                self.current >= self.min_lid as u64
            } else {
                self.current <= self.max_lid as u64
            };
            if !in_range {
                return Ok(None);
            }
            let candidate = self.current as Lid;
            self.current = if self.reverse {
                self.current.wrapping_sub(1)
            } else {
                self.current + 1
            };

            if self.head == Some(candidate) {
                self.head = self.stream.next()?;
                continue;
            }
            return Ok(Some(candidate));
        }
    }
}

/// Iterator over an in-memory posting list slice, bounded and optionally
/// reversed. Used by the active fraction and by tests.
pub struct SliceLidIter<'a> {
    lids: &'a [Lid],
    pos: usize,
    min_lid: Lid,
    max_lid: Lid,
    reverse: bool,
}

impl<'a> SliceLidIter<'a> {
    pub fn new(lids: &'a [Lid], min_lid: Lid, max_lid: Lid, reverse: bool) -> Self {
        SliceLidIter {
            lids,
            pos: if reverse { lids.len() } else { 0 },
            min_lid,
            max_lid,
            reverse,
        }
    }
}

impl LidIter for SliceLidIter<'_> {
    fn next(&mut self) -> Result<Option<Lid>> {
        loop {
            let lid = if self.reverse {
                if self.pos == 0 {
                    return Ok(None);
                }
                self.pos -= 1;
                self.lids[self.pos]
            } else {
                if self.pos >= self.lids.len() {
                    return Ok(None);
                }
                let lid = self.lids[self.pos];
                self.pos += 1;
                lid
            };
            if lid < self.min_lid || lid > self.max_lid {
                continue;
            }
            return Ok(Some(lid));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(mut iter: impl LidIter) -> Vec<Lid> {
        let mut out = Vec::new();
        while let Some(lid) = iter.next().unwrap() {
            out.push(lid);
        }
        out
    }

    fn boxed<'a>(lids: &'a [Lid], reverse: bool) -> Box<dyn LidIter + 'a> {
        Box::new(SliceLidIter::new(lids, 1, u32::MAX, reverse))
    }

    #[test]
    fn test_slice_iter_bounds() {
        let lids = [1u32, 3, 5, 7, 9];
        let iter = SliceLidIter::new(&lids, 3, 7, false);
        assert_eq!(drain(iter), vec![3, 5, 7]);

        let iter = SliceLidIter::new(&lids, 3, 7, true);
        assert_eq!(drain(iter), vec![7, 5, 3]);
    }

    #[test]
    fn test_or_merge_dedup() {
        let a = [1u32, 4, 6];
        let b = [2u32, 4, 9];
        let or = OrIter::new(vec![boxed(&a, false), boxed(&b, false)], false);
        assert_eq!(drain(or), vec![1, 2, 4, 6, 9]);
    }

    #[test]
    fn test_or_merge_reverse() {
        let a = [6u32, 4, 1];
        let b = [9u32, 4, 2];
        let or = OrIter::new(vec![boxed(&a, true), boxed(&b, true)], true);
        // reverse slices iterate back-to-front, so feed them reversed
        assert_eq!(drain(or), vec![9, 6, 4, 2, 1]);
    }

    #[test]
    fn test_or_empty_inputs() {
        let or = OrIter::new(vec![], false);
        assert_eq!(drain(or), Vec::<Lid>::new());
    }

    #[test]
    fn test_and_intersection() {
        let a = [1u32, 3, 5, 7];
        let b = [2u32, 3, 7, 8];
        let and = AndIter {
            left: boxed(&a, false),
            right: boxed(&b, false),
            reverse: false,
        };
        assert_eq!(drain(and), vec![3, 7]);
    }

    #[test]
    fn test_and_disjoint() {
        let a = [1u32, 2];
        let b = [3u32, 4];
        let and = AndIter {
            left: boxed(&a, false),
            right: boxed(&b, false),
            reverse: false,
        };
        assert_eq!(drain(and), Vec::<Lid>::new());
    }

    #[test]
    fn test_not_complement() {
        let a = [2u32, 4];
        let not = NotIter::new(boxed(&a, false), 1, 5, false);
        assert_eq!(drain(not), vec![1, 3, 5]);
    }

    #[test]
    fn test_not_reverse() {
        let a = [4u32, 2];
        let not = NotIter::new(boxed(&a, true), 1, 5, true);
        assert_eq!(drain(not), vec![5, 3, 1]);
    }

    #[test]
    fn test_not_of_empty_stream() {
        let a: [u32; 0] = [];
        let not = NotIter::new(boxed(&a, false), 1, 3, false);
        assert_eq!(drain(not), vec![1, 2, 3]);
    }

    #[test]
    fn test_not_full_range_from_one() {
        // min_lid 1, reverse mode must terminate cleanly at the lower edge
        let a = [1u32];
        let not = NotIter::new(boxed(&a, true), 1, 3, true);
        assert_eq!(drain(not), vec![3, 2]);
    }
}

//! Reduction trees over per-thread "next epoch to persist" values.
//!
//! Each worker owns one leaf. A leaf holds the oldest epoch for which the
//! worker may still have entries waiting for a write-back, and every inner
//! node holds the minimum of its subtree. The epoch advancer asks the root
//! whether anybody still owes epoch `e` and walks down to the thread that
//! does, instead of scanning every worker at every boundary.
//!
//! Two trees are provided:
//! - [`Mindicator`] lets a leaf move in both directions. Decreases are pushed
//!   up (arrive), increases are re-derived from the children (depart), and
//!   nodes touched by an in-flight arrive are marked dirty so a concurrent
//!   depart does not undo them.
//! - [`IncreasingMindicator`] only ever raises a leaf, so a single upward pass
//!   of "raise to the min of my children" is enough.
//!
//! The tree is stored as an implicit binary heap: `2n - 1` nodes for `n`
//! leaves, which makes every inner node have exactly two children. A single
//! worker is padded to two leaves and the extra leaf is pinned to
//! [`NOTHING_PENDING`].
//!
//! 对每线程"下一个待持久化纪元"值的归约树。每个工作线程拥有一个叶子，内部节点保存子树最小值。

use crate::block::{EPOCH_WINDOW, NULL_EPOCH, bucket_of};
use crate::sync::{AtomicBool, AtomicU64, Ordering};
use crossbeam_utils::{Backoff, CachePadded};

/// Leaf value meaning the thread owes no write-back.
/// 叶子值：该线程没有待写回的条目。
pub const NOTHING_PENDING: u64 = (1 << (64 - MARK_BITS)) - 1;

/// Low bits of a node word: bit 0 is the dirty flag, the rest a generation
/// counter bumped on every successful CAS.
const MARK_BITS: u32 = 24;
const DIRTY: u64 = 1;
const COUNTER_MASK: u64 = ((1 << MARK_BITS) - 1) & !DIRTY;

/// Failed root-to-leaf searches tolerated before falling back to a leaf scan.
const MAX_DESCENTS: usize = 64;

/// Shape of the implicit tree shared by both variants.
#[derive(Debug, Clone, Copy)]
struct Shape {
    task_num: usize,
    leaves: usize,
}

impl Shape {
    fn new(task_num: usize) -> Self {
        assert!(task_num > 0, "a persist tracker needs at least one thread");
        Self {
            task_num,
            leaves: task_num.max(2),
        }
    }

    #[inline]
    fn node_count(self) -> usize {
        2 * self.leaves - 1
    }

    #[inline]
    fn leaf(self, tid: usize) -> usize {
        debug_assert!(tid < self.task_num);
        self.leaves - 1 + tid
    }

    /// Leaves past the last thread, present when a single thread is padded
    /// to two leaves.
    #[inline]
    fn padding_leaves(self) -> std::ops::Range<usize> {
        self.leaves - 1 + self.task_num..self.node_count()
    }

    #[inline]
    fn is_leaf(self, node: usize) -> bool {
        node >= self.leaves - 1
    }

    #[inline]
    fn tid_of(self, node: usize) -> usize {
        node - (self.leaves - 1)
    }

    #[inline]
    fn parent(node: usize) -> usize {
        (node - 1) / 2
    }

    #[inline]
    fn children(node: usize) -> [usize; 2] {
        [2 * node + 1, 2 * node + 2]
    }

    #[inline]
    fn sibling(node: usize) -> usize {
        if node % 2 == 1 { node + 1 } else { node - 1 }
    }

    /// Inner nodes from the leaf's parent up to the root.
    fn ancestors(self, tid: usize) -> Ancestors {
        let mut path = Ancestors {
            nodes: [0; 64],
            len: 0,
        };
        let mut node = self.leaf(tid);
        while node != 0 {
            node = Self::parent(node);
            path.nodes[path.len] = node;
            path.len += 1;
        }
        path
    }
}

struct Ancestors {
    nodes: [usize; 64],
    len: usize,
}

impl Ancestors {
    #[inline]
    fn as_slice(&self) -> &[usize] {
        &self.nodes[..self.len]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MarkedVal(u64);

impl MarkedVal {
    #[inline]
    fn new(val: u64, dirty: bool) -> Self {
        Self((val << MARK_BITS) | dirty as u64)
    }

    #[inline]
    fn val(self) -> u64 {
        self.0 >> MARK_BITS
    }

    #[inline]
    fn is_dirty(self) -> bool {
        self.0 & DIRTY != 0
    }

    #[inline]
    fn counter(self) -> u64 {
        self.0 & COUNTER_MASK
    }

    /// `self` stamped with the generation that follows `old`.
    #[inline]
    fn after(self, old: MarkedVal) -> Self {
        Self((self.0 & !COUNTER_MASK) | ((old.counter() + 2) & COUNTER_MASK))
    }
}

/// Mindicator whose leaves may both rise and fall.
///
/// A leaf is written only by its owning thread, or by whoever holds that
/// thread's write-back lock. Different leaves race freely.
///
/// 叶子值可增可减的 Mindicator。
pub struct Mindicator {
    shape: Shape,
    nodes: Box<[CachePadded<AtomicU64>]>,
    has_write_op: [Box<[CachePadded<AtomicBool>]>; EPOCH_WINDOW],
}

impl Mindicator {
    pub fn new(task_num: usize) -> Self {
        let shape = Shape::new(task_num);
        let nodes = (0..shape.node_count())
            .map(|_| CachePadded::new(AtomicU64::new(MarkedVal::new(NOTHING_PENDING, false).0)))
            .collect();
        let has_write_op = std::array::from_fn(|_| {
            (0..task_num)
                .map(|_| CachePadded::new(AtomicBool::new(false)))
                .collect()
        });
        Self {
            shape,
            nodes,
            has_write_op,
        }
    }

    #[inline]
    fn load(&self, node: usize) -> MarkedVal {
        MarkedVal(self.nodes[node].load(Ordering::Acquire))
    }

    #[inline]
    fn cas(&self, node: usize, old: MarkedVal, target: MarkedVal) -> bool {
        self.nodes[node]
            .compare_exchange(old.0, target.after(old).0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Set thread `tid`'s leaf to `val` and repair the summaries above it.
    ///
    /// 将线程 `tid` 的叶子设为 `val` 并修复其上的汇总值。
    pub fn change(&self, val: u64, tid: usize) {
        assert!(val <= NOTHING_PENDING, "BUG: epoch {val} does not fit in a mindicator node");
        let leaf = self.shape.leaf(tid);
        let mut old = self.load(leaf);
        loop {
            if old.val() == val {
                return;
            }
            if self.cas(leaf, old, MarkedVal::new(val, false)) {
                break;
            }
            old = self.load(leaf);
        }
        self.arrive(val, tid);
        self.depart(old.val(), tid);
    }

    fn clean(&self, val: u64, node: usize) {
        let x = self.load(node);
        if x.val() == val && x.is_dirty() {
            self.cas(node, x, MarkedVal::new(val, false));
        }
    }

    /// Returns `true` once the node already covers `val` and nothing above
    /// needs to change.
    fn propagate(&self, val: u64, node: usize) -> bool {
        loop {
            let x = self.load(node);
            if x.val() > val {
                if self.cas(node, x, MarkedVal::new(val, true)) {
                    return false;
                }
            } else if x.is_dirty() {
                return false;
            } else if self.cas(node, x, x) {
                return true;
            }
        }
    }

    /// Re-derive `node` from its children after a leaf rose from `val`.
    /// Returns `true` when ancestors cannot be affected.
    fn summarize(&self, val: u64, node: usize) -> bool {
        loop {
            let x = self.load(node);
            if x.is_dirty() {
                return x.val() < val;
            }
            let [left, right] = Shape::children(node);
            let children_min = self.load(left).val().min(self.load(right).val());
            if children_min < x.val() && children_min < val {
                return true;
            }
            if self.cas(node, x, MarkedVal::new(children_min, children_min < x.val())) {
                return x.val() < val;
            }
        }
    }

    fn arrive(&self, val: u64, tid: usize) {
        let path = self.shape.ancestors(tid);
        let path = path.as_slice();
        let mut last = 0;
        for (i, &node) in path.iter().enumerate() {
            last = i;
            if self.propagate(val, node) {
                break;
            }
        }
        if path.is_empty() {
            return;
        }
        for &node in path[..=last].iter().rev() {
            self.clean(val, node);
        }
    }

    fn depart(&self, val: u64, tid: usize) {
        for &node in self.shape.ancestors(tid).as_slice() {
            if self.summarize(val, node) {
                break;
            }
        }
    }

    fn find_next_thread_le(&self, node: usize, val: u64) -> Option<usize> {
        if self.load(node).val() > val {
            return None;
        }
        if self.shape.is_leaf(node) {
            let tid = self.shape.tid_of(node);
            return (tid < self.shape.task_num).then_some(tid);
        }
        let [left, right] = Shape::children(node);
        self.find_next_thread_le(left, val)
            .or_else(|| self.find_next_thread_le(right, val))
    }

    fn scan_leaves(&self, val: u64) -> Option<usize> {
        (0..self.shape.task_num).find(|&tid| self.load(self.shape.leaf(tid)).val() <= val)
    }

    /// Note that `tid` wrote in epoch `e` for the first time.
    pub fn first_write_on_new_epoch(&self, e: u64, tid: usize) {
        self.has_write_op[bucket_of(e)][tid].store(true, Ordering::Release);
        if self.load(self.shape.leaf(tid)).val() > e {
            self.change(e, tid);
        }
    }

    /// Note that every write of `tid` up to and including epoch `e` is durable.
    pub fn after_persist_epoch(&self, e: u64, tid: usize) {
        for past in e.saturating_sub(2)..=e {
            self.has_write_op[bucket_of(past)][tid].store(false, Ordering::Release);
        }
        let next = (e + 1..=e + 2)
            .find(|&later| self.has_write_op[bucket_of(later)][tid].load(Ordering::Acquire))
            .unwrap_or(NOTHING_PENDING);
        self.change(next, tid);
    }

    /// Some thread whose leaf is at or below `val`, if any.
    ///
    /// 返回叶子值不大于 `val` 的某个线程。
    pub fn next_thread_to_persist(&self, val: u64) -> Option<usize> {
        let backoff = Backoff::new();
        for _ in 0..MAX_DESCENTS {
            if self.load(0).val() > val {
                return None;
            }
            if let Some(tid) = self.find_next_thread_le(0, val) {
                return Some(tid);
            }
            backoff.snooze();
        }
        self.scan_leaves(val)
    }

    /// Like [`next_thread_to_persist`](Self::next_thread_to_persist), but
    /// searches outward from `curr`'s leaf first.
    pub fn next_thread_to_persist_from(&self, val: u64, curr: usize) -> Option<usize> {
        let mut node = self.shape.leaf(curr);
        if self.load(node).val() <= val {
            return Some(curr);
        }
        while node != 0 {
            let parent = Shape::parent(node);
            if self.load(parent).val() <= val {
                if let Some(tid) = self.find_next_thread_le(Shape::sibling(node), val) {
                    return Some(tid);
                }
            }
            node = parent;
        }
        None
    }

    /// The oldest epoch `tid` still owes, or [`NULL_EPOCH`] if none.
    pub fn next_epoch_to_persist(&self, tid: usize) -> u64 {
        match self.load(self.shape.leaf(tid)).val() {
            NOTHING_PENDING => NULL_EPOCH,
            val => val,
        }
    }
}

/// Mindicator for leaves that only ever rise.
///
/// Every leaf starts at [`NULL_EPOCH`], "owes everything", and is raised to
/// `e + 1` once the thread's writes up to `e` are durable.
///
/// 叶子值只增不减的 Mindicator。
pub struct IncreasingMindicator {
    shape: Shape,
    nodes: Box<[CachePadded<AtomicU64>]>,
}

impl IncreasingMindicator {
    pub fn new(task_num: usize) -> Self {
        let shape = Shape::new(task_num);
        let mut values = vec![NULL_EPOCH; shape.node_count()];
        for node in shape.padding_leaves() {
            values[node] = NOTHING_PENDING;
        }
        for node in (0..shape.leaves - 1).rev() {
            let [left, right] = Shape::children(node);
            values[node] = values[left].min(values[right]);
        }
        let nodes = values
            .into_iter()
            .map(|val| CachePadded::new(AtomicU64::new(val)))
            .collect();
        Self { shape, nodes }
    }

    #[inline]
    fn load(&self, node: usize) -> u64 {
        self.nodes[node].load(Ordering::Acquire)
    }

    /// Raise `node` to the minimum of its children. Returns `true` if the
    /// node did not change, so nothing above it can.
    fn propagate(&self, node: usize) -> bool {
        let [left, right] = Shape::children(node);
        let mut old = self.load(node);
        loop {
            let new_min = self.load(left).min(self.load(right));
            if new_min <= old {
                return true;
            }
            match self.nodes[node].compare_exchange(old, new_min, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return false,
                Err(current) => old = current,
            }
        }
    }

    pub fn first_write_on_new_epoch(&self, _e: u64, _tid: usize) {}

    pub fn after_persist_epoch(&self, e: u64, tid: usize) {
        let leaf = self.shape.leaf(tid);
        let mut old = self.load(leaf);
        loop {
            if old > e {
                return;
            }
            match self.nodes[leaf].compare_exchange(old, e + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(current) => old = current,
            }
        }
        let mut node = leaf;
        while node != 0 {
            node = Shape::parent(node);
            if self.propagate(node) {
                return;
            }
        }
    }

    fn find_next_thread_le(&self, node: usize, val: u64) -> Option<usize> {
        if self.load(node) > val {
            return None;
        }
        if self.shape.is_leaf(node) {
            let tid = self.shape.tid_of(node);
            return (tid < self.shape.task_num).then_some(tid);
        }
        let [left, right] = Shape::children(node);
        self.find_next_thread_le(left, val)
            .or_else(|| self.find_next_thread_le(right, val))
    }

    pub fn next_thread_to_persist(&self, val: u64) -> Option<usize> {
        let backoff = Backoff::new();
        for _ in 0..MAX_DESCENTS {
            if self.load(0) > val {
                return None;
            }
            if let Some(tid) = self.find_next_thread_le(0, val) {
                return Some(tid);
            }
            backoff.snooze();
        }
        (0..self.shape.task_num).find(|&tid| self.load(self.shape.leaf(tid)) <= val)
    }

    pub fn next_thread_to_persist_from(&self, val: u64, curr: usize) -> Option<usize> {
        let mut node = self.shape.leaf(curr);
        if self.load(node) <= val {
            return Some(curr);
        }
        while node != 0 {
            let parent = Shape::parent(node);
            if self.load(parent) <= val {
                if let Some(tid) = self.find_next_thread_le(Shape::sibling(node), val) {
                    return Some(tid);
                }
            }
            node = parent;
        }
        None
    }

    pub fn next_epoch_to_persist(&self, tid: usize) -> u64 {
        self.load(self.shape.leaf(tid))
    }
}

/// The persist tracker selected for an engine.
pub(crate) enum PersistTracker {
    Mindicator(Mindicator),
    Increasing(IncreasingMindicator),
}

impl PersistTracker {
    #[inline]
    pub(crate) fn first_write_on_new_epoch(&self, e: u64, tid: usize) {
        match self {
            Self::Mindicator(m) => m.first_write_on_new_epoch(e, tid),
            Self::Increasing(m) => m.first_write_on_new_epoch(e, tid),
        }
    }

    #[inline]
    pub(crate) fn after_persist_epoch(&self, e: u64, tid: usize) {
        match self {
            Self::Mindicator(m) => m.after_persist_epoch(e, tid),
            Self::Increasing(m) => m.after_persist_epoch(e, tid),
        }
    }

    #[inline]
    pub(crate) fn next_thread_to_persist(&self, e: u64) -> Option<usize> {
        match self {
            Self::Mindicator(m) => m.next_thread_to_persist(e),
            Self::Increasing(m) => m.next_thread_to_persist(e),
        }
    }

    #[inline]
    pub(crate) fn next_thread_to_persist_from(&self, e: u64, curr: usize) -> Option<usize> {
        match self {
            Self::Mindicator(m) => m.next_thread_to_persist_from(e, curr),
            Self::Increasing(m) => m.next_thread_to_persist_from(e, curr),
        }
    }

    /// The oldest epoch `tid` may still owe. [`NULL_EPOCH`] from the general
    /// tree means nothing; from the increasing tree it means "never drained".
    #[inline]
    pub(crate) fn owes_before(&self, e: u64, tid: usize) -> bool {
        match self {
            Self::Mindicator(m) => {
                let next = m.next_epoch_to_persist(tid);
                next != NULL_EPOCH && next < e
            }
            Self::Increasing(m) => m.next_epoch_to_persist(tid) < e,
        }
    }
}

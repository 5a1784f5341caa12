//! Ordered, deduplicated message log for one conversation, grouped into
//! author blocks.
//!
//! Messages are kept sorted by creation time, ties broken by the order in
//! which they reached the timeline. A message joins the block before it when
//! [`GroupingPolicy::admits`] holds against that block's anchor, its oldest
//! message. The blocks are always the greedy partition of the sorted log, so
//! the final structure depends only on the set of messages and never on the
//! order they arrived in.
//!
//! Blocks live in a `BTreeMap` keyed by their first entry, which gives an
//! ordered search over block anchors without scanning the whole log.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound::{Excluded, Unbounded};

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, TimeDelta, Utc};

use crate::message::{Author, Message, MessageId, UserId};

/// Maximum distance from a block's anchor to any of its messages (10 minutes).
pub const GROUPING_WINDOW_MS: i64 = 600_000;
/// Size of a full history page served by the portal.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Rule deciding whether a message belongs to a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupingPolicy {
    window: TimeDelta,
    offset: FixedOffset,
}

impl Default for GroupingPolicy {
    fn default() -> Self {
        Self {
            window: TimeDelta::milliseconds(GROUPING_WINDOW_MS),
            offset: Utc.fix(),
        }
    }
}

impl GroupingPolicy {
    /// `offset` is the zone whose calendar days split blocks.
    pub fn new(window: TimeDelta, offset: FixedOffset) -> Self {
        Self { window, offset }
    }

    pub fn window(&self) -> TimeDelta {
        self.window
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Calendar day of `at` in the policy's zone.
    pub fn day(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    /// Whether `message` may join the block whose oldest message is `anchor`.
    pub fn admits(&self, anchor: &Message, message: &Message) -> bool {
        anchor.author.id == message.author.id
            && message.created_at - anchor.created_at < self.window
            && self.day(anchor.created_at) == self.day(message.created_at)
    }
}

/// What an insertion did to the timeline, so a renderer can choose between
/// appending a line and redrawing blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertResult {
    /// The message started a block of its own.
    NewBlock,
    /// The message joined the block before or after it.
    Merged,
    /// The message joined or started a block and later blocks of the same
    /// author were regrouped around it.
    Regrouped,
    /// The message landed inside another author's block and split it.
    Split,
    /// The id was already present; nothing changed.
    Duplicate,
}

impl InsertResult {
    pub fn is_inserted(self) -> bool {
        self != Self::Duplicate
    }

    /// True when more than one block changed shape.
    pub fn restructures(self) -> bool {
        matches!(self, Self::Regrouped | Self::Split)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct EntryKey {
    at: DateTime<Utc>,
    seq: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Entry {
    seq: u64,
    message: Message,
}

impl Entry {
    fn key(&self) -> EntryKey {
        EntryKey {
            at: self.message.created_at,
            seq: self.seq,
        }
    }
}

/// Consecutive messages of one author. Never empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    author: UserId,
    entries: Vec<Entry>,
}

impl Block {
    fn single(entry: Entry) -> Self {
        Self {
            author: entry.message.author.id,
            entries: vec![entry],
        }
    }

    fn from_entries(entries: Vec<Entry>) -> Option<Self> {
        let author = entries.first()?.message.author.id;
        Some(Self { author, entries })
    }

    pub fn author(&self) -> UserId {
        self.author
    }

    /// Display data of the author, taken from the block's first message.
    pub fn author_info(&self) -> &Author {
        &self.first().author
    }

    /// Time used to place the block; moves back when older messages join.
    pub fn anchor_time(&self) -> DateTime<Utc> {
        self.first().created_at
    }

    pub fn last_time(&self) -> DateTime<Utc> {
        self.last().created_at
    }

    pub fn first(&self) -> &Message {
        &self.entries[0].message
    }

    pub fn last(&self) -> &Message {
        &self.entries[self.entries.len() - 1].message
    }

    pub fn messages(&self) -> impl DoubleEndedIterator<Item = &Message> + '_ {
        self.entries.iter().map(|e| &e.message)
    }

    pub fn message_ids(&self) -> Vec<MessageId> {
        self.messages().map(|m| m.id).collect()
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn first_key(&self) -> EntryKey {
        self.entries[0].key()
    }

    fn last_key(&self) -> EntryKey {
        self.entries[self.entries.len() - 1].key()
    }

    fn keys(&self) -> Vec<EntryKey> {
        self.entries.iter().map(Entry::key).collect()
    }

    /// Detach every entry ordered after `key`.
    fn split_off_after(&mut self, key: EntryKey) -> Vec<Entry> {
        let pos = self.entries.partition_point(|e| e.key() < key);
        self.entries.split_off(pos)
    }
}

/// One conversation's message log.
#[derive(Clone, Debug)]
pub struct ChatTimeline {
    policy: GroupingPolicy,
    blocks: BTreeMap<EntryKey, Block>,
    index: HashMap<MessageId, EntryKey>,
    next_seq: u64,
    min_loaded: Option<MessageId>,
    page_size: usize,
    has_more: bool,
}

impl Default for ChatTimeline {
    fn default() -> Self {
        Self::new(GroupingPolicy::default(), DEFAULT_PAGE_SIZE)
    }
}

impl ChatTimeline {
    pub fn new(policy: GroupingPolicy, page_size: usize) -> Self {
        Self {
            policy,
            blocks: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            min_loaded: None,
            page_size: page_size.max(1),
            has_more: true,
        }
    }

    /// Insert one message wherever it belongs. Inserting an id twice is a
    /// no-op reported as [`InsertResult::Duplicate`].
    pub fn insert(&mut self, message: Message) -> InsertResult {
        if self.index.contains_key(&message.id) {
            tracing::trace!(message = %message.id, "duplicate message ignored");
            return InsertResult::Duplicate;
        }
        let entry = self.admit(message);
        self.place(entry)
    }

    /// Apply a page of history. Returns how many messages were new.
    ///
    /// A page older than everything already loaded (the usual case when
    /// scrolling back) is grouped in a single pass and stitched to the first
    /// block; anything else falls back to ordered insertion per message.
    pub fn insert_batch(&mut self, messages: Vec<Message>) -> usize {
        let page_len = messages.len();
        let mut seen = HashSet::with_capacity(page_len);
        let mut fresh: Vec<Message> = messages
            .into_iter()
            .filter(|m| !self.index.contains_key(&m.id) && seen.insert(m.id))
            .collect();
        fresh.sort_by_key(|m| m.created_at);

        let entries: Vec<Entry> = fresh.into_iter().map(|m| self.admit(m)).collect();
        let inserted = entries.len();

        let older_than_loaded = match (entries.last(), self.blocks.first_key_value()) {
            (Some(last), Some((first, _))) => last.key() < *first,
            _ => true,
        };
        if older_than_loaded {
            self.prepend_sorted(entries);
        } else {
            for entry in entries {
                self.place(entry);
            }
        }

        self.has_more = page_len >= self.page_size;
        tracing::debug!(
            page = page_len,
            inserted,
            blocks = self.blocks.len(),
            has_more = self.has_more,
            "history page applied"
        );
        inserted
    }

    /// Whether another (older) page should be requested.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Lowest message id seen so far; the cursor for the next history page.
    pub fn min_loaded_id(&self) -> Option<MessageId> {
        self.min_loaded
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn policy(&self) -> &GroupingPolicy {
        &self.policy
    }

    pub fn blocks(&self) -> impl DoubleEndedIterator<Item = &Block> + '_ {
        self.blocks.values()
    }

    /// Owned copy of the blocks, oldest first.
    pub fn snapshot(&self) -> Vec<Block> {
        self.blocks.values().cloned().collect()
    }

    /// Compact view of the structure: author and message ids of each block.
    pub fn layout(&self) -> Vec<(UserId, Vec<MessageId>)> {
        self.blocks
            .values()
            .map(|b| (b.author(), b.message_ids()))
            .collect()
    }

    /// The block currently holding `id`.
    pub fn block_of(&self, id: MessageId) -> Option<&Block> {
        let key = self.index.get(&id)?;
        self.blocks.range(..=*key).next_back().map(|(_, b)| b)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn latest(&self) -> Option<&Message> {
        self.blocks.values().next_back().map(Block::last)
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn admit(&mut self, message: Message) -> Entry {
        let id = message.id;
        let entry = Entry {
            seq: self.next_seq,
            message,
        };
        self.next_seq += 1;
        self.index.insert(id, entry.key());
        self.min_loaded = Some(self.min_loaded.map_or(id, |min| min.min(id)));
        entry
    }

    fn put(&mut self, block: Block) {
        self.blocks.insert(block.first_key(), block);
    }

    fn take_before(&mut self, key: EntryKey) -> Option<Block> {
        let found = *self.blocks.range(..key).next_back()?.0;
        self.blocks.remove(&found)
    }

    /// Remove the blocks following `key` for as long as they belong to `author`.
    fn take_run_after(&mut self, key: EntryKey, author: UserId) -> Vec<Block> {
        let mut run = Vec::new();
        loop {
            let Some((&first, block)) = self.blocks.range((Excluded(key), Unbounded)).next() else {
                break;
            };
            if block.author != author {
                break;
            }
            if let Some(block) = self.blocks.remove(&first) {
                run.push(block);
            }
        }
        run
    }

    /// Greedy partition of sorted entries: each block takes every following
    /// entry its anchor admits.
    fn regroup(&self, entries: Vec<Entry>) -> Vec<Block> {
        let mut built: Vec<Block> = Vec::new();
        for entry in entries {
            if let Some(block) = built
                .last_mut()
                .filter(|b| self.policy.admits(b.first(), &entry.message))
            {
                block.entries.push(entry);
                continue;
            }
            built.push(Block::single(entry));
        }
        built
    }

    fn place(&mut self, entry: Entry) -> InsertResult {
        let key = entry.key();
        let author = entry.message.author.id;
        let mut run = Vec::new();

        match self.take_before(key) {
            // Inside another author's block: cut it around the message and
            // regroup what follows from the cut.
            Some(mut prev) if prev.author != author && key < prev.last_key() => {
                let owner = prev.author;
                let mut tail = prev.split_off_after(key);
                self.put(prev);
                self.put(Block::single(entry));
                tail.extend(self.take_run_after(key, owner).into_iter().flat_map(|b| b.entries));
                for block in self.regroup(tail) {
                    self.put(block);
                }
                return InsertResult::Split;
            }
            Some(prev) if prev.author == author => run.push(prev),
            Some(prev) => self.put(prev),
            None => {}
        }
        run.extend(self.take_run_after(key, author));

        let before: Vec<Vec<EntryKey>> = run.iter().map(Block::keys).collect();
        let mut entries: Vec<Entry> = run.into_iter().flat_map(|b| b.entries).collect();
        let pos = entries.partition_point(|e| e.key() < key);
        entries.insert(pos, entry);

        let blocks = self.regroup(entries);
        let after: Vec<Vec<EntryKey>> = blocks
            .iter()
            .map(|b| b.keys().into_iter().filter(|k| *k != key).collect::<Vec<_>>())
            .filter(|keys| !keys.is_empty())
            .collect();
        let alone = blocks.iter().any(|b| b.len() == 1 && b.first_key() == key);
        for block in blocks {
            self.put(block);
        }

        match (after == before, alone) {
            (false, _) => InsertResult::Regrouped,
            (true, true) => InsertResult::NewBlock,
            (true, false) => InsertResult::Merged,
        }
    }

    /// Group entries that all precede the current first block, together with
    /// the leading blocks they may reach into.
    fn prepend_sorted(&mut self, mut entries: Vec<Entry>) {
        if let Some(last) = entries.last() {
            let author = last.message.author.id;
            let key = last.key();
            entries.extend(self.take_run_after(key, author).into_iter().flat_map(|b| b.entries));
        }
        for block in self.regroup(entries) {
            self.put(block);
        }
    }
}

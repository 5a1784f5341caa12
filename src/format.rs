//! Plain-text rendering of blocks, headers and listings.

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};

use crate::conversation::Conversation;
use crate::message::Message;
use crate::timeline::Block;

/// Relative date of a block header: `Today at 14:05`, `Yesterday at 09:30`
/// or `2021/03/01 10:00`, all in `offset`.
pub fn date_label(at: DateTime<Utc>, now: DateTime<Utc>, offset: FixedOffset) -> String {
    let local = at.with_timezone(&offset);
    let today = now.with_timezone(&offset).date_naive();
    let time = local.format("%H:%M");

    if local.date_naive() == today {
        format!("Today at {}", time)
    } else if today
        .checked_sub_signed(TimeDelta::days(1))
        .is_some_and(|yesterday| local.date_naive() == yesterday)
    {
        format!("Yesterday at {}", time)
    } else {
        local.format("%Y/%m/%d %H:%M").to_string()
    }
}

pub fn block_header(block: &Block, now: DateTime<Utc>, offset: FixedOffset) -> String {
    format!(
        "{} · {}",
        block.author_info().nickname,
        date_label(block.anchor_time(), now, offset)
    )
}

pub fn message_line(message: &Message, offset: FixedOffset) -> String {
    format!(
        "  {} {}",
        message.created_at.with_timezone(&offset).format("%H:%M"),
        message.content
    )
}

/// Header followed by one line per message.
pub fn render_block(block: &Block, now: DateTime<Utc>, offset: FixedOffset) -> Vec<String> {
    let mut lines = Vec::with_capacity(block.len() + 1);
    lines.push(block_header(block, now, offset));
    lines.extend(block.messages().map(|m| message_line(m, offset)));
    lines
}

/// One row of `/list`: current marker, id, title and unseen marker.
pub fn listing_line(conversation: &Conversation, current: bool) -> String {
    format!(
        "{} {:>5}  {}{}",
        if current { '>' } else { ' ' },
        conversation.id(),
        conversation.meta.title(None),
        if conversation.has_unseen() { "  (new)" } else { "" }
    )
}

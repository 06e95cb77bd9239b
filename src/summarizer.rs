use crate::history::StoredMessage;

/// Selects the suffix of `messages` whose combined content length stays
/// within `max_chars`, walking newest to oldest and returning the selection
/// in chronological order.
///
/// The newest message is always admitted, even when it alone exceeds the
/// budget: an over-long latest message must still reach the prompt rather
/// than produce an empty context.
pub fn summarize(messages: &[StoredMessage], max_chars: usize) -> Vec<StoredMessage> {
    let mut picked: Vec<StoredMessage> = Vec::new();
    let mut total = 0usize;
    for message in messages.iter().rev() {
        let length = message.content.chars().count();
        if !picked.is_empty() && total + length > max_chars {
            break;
        }
        picked.push(message.clone());
        total += length;
    }
    picked.reverse();
    picked
}

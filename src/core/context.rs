//! Request contexts and their pub/sub channel keys.

use crate::core::error::ContextError;
use uuid::Uuid;

const CHANNEL_PREFIX: &str = "horoscoper:context:";

/// Returns the pub/sub channel bound to the context with the given id.
pub fn channel_key(id: &Uuid) -> String {
    format!("{CHANNEL_PREFIX}{}", id.hyphenated())
}

/// One caller's in-flight request.
///
/// Contexts are immutable once created. The id is a random v4 UUID, which keeps
/// collisions between live contexts out of the picture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestContext {
    id: Uuid,
    prompt: String,
}

impl RequestContext {
    /// Creates a context for `prompt`, rejecting prompts longer than `max_len` characters.
    pub fn new(prompt: impl Into<String>, max_len: usize) -> Result<Self, ContextError> {
        let prompt = prompt.into();
        let len = prompt.chars().count();

        if len > max_len {
            return Err(ContextError::TooLong { len, max: max_len });
        }

        Ok(Self {
            id: Uuid::new_v4(),
            prompt,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Channel on which every output chunk of this context is published.
    pub fn channel(&self) -> String {
        channel_key(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_get_distinct_ids_and_channels() {
        let a = RequestContext::new("same prompt", 64).unwrap();
        let b = RequestContext::new("same prompt", 64).unwrap();

        assert_ne!(a.id(), b.id());
        assert_ne!(a.channel(), b.channel());
    }

    #[test]
    fn test_channel_is_derived_from_id() {
        let context = RequestContext::new("aries", 64).unwrap();

        assert_eq!(context.channel(), channel_key(&context.id()));
        assert!(context.channel().ends_with(&context.id().to_string()));
    }

    #[test]
    fn test_prompt_length_is_counted_in_chars() {
        // 6 cyrillic chars, 12 bytes
        assert!(RequestContext::new("сердце", 6).is_ok());

        let err = RequestContext::new("сердце!", 6).unwrap_err();
        assert_eq!(err, ContextError::TooLong { len: 7, max: 6 });
    }

    #[test]
    fn test_empty_prompt_is_allowed() {
        let context = RequestContext::new("", 16).unwrap();
        assert_eq!(context.prompt(), "");
    }
}

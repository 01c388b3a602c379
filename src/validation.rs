use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use validator::{Validate, ValidationError};

use crate::error::TarotError;

/// Number of cards in the deck.
pub const DECK_SIZE: u32 = 78;

/// Body of `POST /v1/tarot/readings`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ReadingRequest {
    #[validate(length(min = 1, max = 64, message = "user_id must be 1-64 characters"))]
    pub user_id: String,

    #[validate(length(min = 1, max = 1000, message = "question must be 1-1000 characters"))]
    pub question: String,

    #[validate(
        length(min = 1, max = 3, message = "draw between one and three cards"),
        custom(function = "validate_cards")
    )]
    pub cards: Vec<u32>,
}

fn validate_cards(cards: &Vec<u32>) -> Result<(), ValidationError> {
    if cards.iter().any(|card| !(1..=DECK_SIZE).contains(card)) {
        let mut error = ValidationError::new("card_out_of_range");
        error.message = Some(format!("cards must be numbered 1-{}", DECK_SIZE).into());
        return Err(error);
    }
    Ok(())
}

impl ReadingRequest {
    /// Validate and normalise the request.
    pub fn validated(mut self) -> Result<Self, TarotError> {
        self.user_id = self.user_id.trim().to_string();
        self.question = self.question.trim().to_string();
        self.validate()?;
        Ok(self)
    }
}

fn task_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("task id pattern is valid"))
}

/// Reject ids that could not have been generated by this service before they
/// reach the store.
pub fn validate_task_id(task_id: &str) -> Result<(), TarotError> {
    if task_id_pattern().is_match(task_id) {
        Ok(())
    } else {
        Err(TarotError::InvalidFormat(format!("invalid task id '{}'", task_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::generate_task_id;

    fn request(user_id: &str, question: &str, cards: Vec<u32>) -> ReadingRequest {
        ReadingRequest {
            user_id: user_id.to_string(),
            question: question.to_string(),
            cards,
        }
    }

    #[test]
    fn test_valid_request() {
        let req = request(" u1 ", " Will I find love? ", vec![1, 15, 21])
            .validated()
            .unwrap();
        assert_eq!(req.user_id, "u1");
        assert_eq!(req.question, "Will I find love?");
    }

    #[test]
    fn test_blank_fields_are_rejected() {
        assert!(matches!(
            request("   ", "q", vec![1]).validated(),
            Err(TarotError::Validation(_))
        ));
        assert!(request("u1", "", vec![1]).validated().is_err());
    }

    #[test]
    fn test_card_count_and_range() {
        assert!(request("u1", "q", vec![]).validated().is_err());
        assert!(request("u1", "q", vec![1, 2, 3, 4]).validated().is_err());
        assert!(request("u1", "q", vec![0]).validated().is_err());
        assert!(request("u1", "q", vec![79]).validated().is_err());
        assert!(request("u1", "q", vec![78]).validated().is_ok());
    }

    #[test]
    fn test_task_id_format() {
        assert!(validate_task_id(&generate_task_id()).is_ok());
        assert!(validate_task_id("task_abc-123").is_ok());
        assert!(validate_task_id("").is_err());
        assert!(validate_task_id("../etc/passwd").is_err());
        assert!(validate_task_id("tarot:queue:tasks").is_err());
        assert!(validate_task_id(&"a".repeat(65)).is_err());
    }
}

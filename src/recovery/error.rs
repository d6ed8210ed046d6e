//! Classified processing failures raised by handlers.
//!
//! A handler raises a [`ProcessingError`] when a failure needs remediation
//! that lives outside the handler (re-scrapes, snapshot correction, price
//! backfill). Everything else either returns `false` or is fatal.

use std::fmt;

use alloy::primitives::I256;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    PriceNotFound,
    SupplyDifference,
    NegativeFees,
    NoHypervisorPeriodEnd,
    FeesWithoutRevenue,
    WrongContractFieldType,
    OverlappedPeriods,
    InvalidRewardDefinition,
    ReturnNone,
    /// A tag this build does not know how to handle.
    Unrecognized(String),
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::PriceNotFound => "price-not-found",
            ErrorKind::SupplyDifference => "supply-difference",
            ErrorKind::NegativeFees => "negative-fees",
            ErrorKind::NoHypervisorPeriodEnd => "no-hypervisor-period-end",
            ErrorKind::FeesWithoutRevenue => "fees-without-revenue",
            ErrorKind::WrongContractFieldType => "wrong-contract-field-type",
            ErrorKind::OverlappedPeriods => "overlapped-periods",
            ErrorKind::InvalidRewardDefinition => "invalid-reward-definition",
            ErrorKind::ReturnNone => "return-none",
            ErrorKind::Unrecognized(tag) => tag,
        }
    }

    pub fn parse(tag: &str) -> Self {
        match tag {
            "price-not-found" => ErrorKind::PriceNotFound,
            "supply-difference" => ErrorKind::SupplyDifference,
            "negative-fees" => ErrorKind::NegativeFees,
            "no-hypervisor-period-end" => ErrorKind::NoHypervisorPeriodEnd,
            "fees-without-revenue" => ErrorKind::FeesWithoutRevenue,
            "wrong-contract-field-type" => ErrorKind::WrongContractFieldType,
            "overlapped-periods" => ErrorKind::OverlappedPeriods,
            "invalid-reward-definition" => ErrorKind::InvalidRewardDefinition,
            "return-none" => ErrorKind::ReturnNone,
            other => ErrorKind::Unrecognized(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Corrective action the raiser suggests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAction {
    ScrapePrice,
    Rescrape,
    NoAction,
    /// Directives like `remove` or `check-manually` that have no automated
    /// remediation.
    Other(String),
}

impl ErrorAction {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "scrape-price" => ErrorAction::ScrapePrice,
            "rescrape" => ErrorAction::Rescrape,
            "none" | "" => ErrorAction::NoAction,
            other => ErrorAction::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorAction::ScrapePrice => f.write_str("scrape-price"),
            ErrorAction::Rescrape => f.write_str("rescrape"),
            ErrorAction::NoAction => f.write_str("none"),
            ErrorAction::Other(tag) => f.write_str(tag),
        }
    }
}

/// Where the failure happened. Which fields are required depends on the kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorContext {
    pub address: Option<String>,
    pub block: Option<u64>,
    pub ini_block: Option<u64>,
    pub end_block: Option<u64>,
    pub ini_timestamp: Option<u64>,
    pub end_timestamp: Option<u64>,
    /// Fee growth between the two snapshots as recorded when the error was raised.
    pub recorded_fees_delta: Option<[I256; 2]>,
    /// Free-form data carried into follow-on queue items.
    pub details: JsonValue,
}

#[derive(Debug, Clone, Error)]
#[error("{kind} ({action}): {message}")]
pub struct ProcessingError {
    pub kind: ErrorKind,
    pub action: ErrorAction,
    pub message: String,
    pub context: ErrorContext,
}

impl ProcessingError {
    pub fn new(kind: ErrorKind, action: ErrorAction, message: impl Into<String>) -> Self {
        Self {
            kind,
            action,
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn price_not_found(token: &str, block: u64) -> Self {
        Self::new(
            ErrorKind::PriceNotFound,
            ErrorAction::ScrapePrice,
            format!("no price for {} at block {}", token, block),
        )
        .with_address(token)
        .at_block(block)
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.context.address = Some(address.to_lowercase());
        self
    }

    pub fn at_block(mut self, block: u64) -> Self {
        self.context.block = Some(block);
        self
    }

    pub fn with_block_range(mut self, ini: u64, end: u64) -> Self {
        self.context.ini_block = Some(ini);
        self.context.end_block = Some(end);
        self
    }

    pub fn with_timestamp_range(mut self, ini: u64, end: u64) -> Self {
        self.context.ini_timestamp = Some(ini);
        self.context.end_timestamp = Some(end);
        self
    }

    pub fn with_recorded_fees_delta(mut self, delta: [I256; 2]) -> Self {
        self.context.recorded_fees_delta = Some(delta);
        self
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.context.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_round_trip() {
        for tag in [
            "price-not-found",
            "supply-difference",
            "negative-fees",
            "no-hypervisor-period-end",
            "fees-without-revenue",
            "wrong-contract-field-type",
            "overlapped-periods",
            "invalid-reward-definition",
            "return-none",
        ] {
            assert_eq!(ErrorKind::parse(tag).as_str(), tag);
        }
        assert_eq!(
            ErrorKind::parse("brand-new-kind"),
            ErrorKind::Unrecognized("brand-new-kind".to_string())
        );
    }

    #[test]
    fn test_action_tags() {
        assert_eq!(ErrorAction::parse("scrape-price"), ErrorAction::ScrapePrice);
        assert_eq!(ErrorAction::parse("rescrape"), ErrorAction::Rescrape);
        assert_eq!(ErrorAction::parse(""), ErrorAction::NoAction);
        let manual = ErrorAction::parse("check-manually");
        assert_eq!(manual, ErrorAction::Other("check-manually".to_string()));
        assert_eq!(manual.to_string(), "check-manually");
    }

    #[test]
    fn test_price_not_found_builder() {
        let err = ProcessingError::price_not_found("0xABCD", 42);
        assert_eq!(err.kind, ErrorKind::PriceNotFound);
        assert_eq!(err.action, ErrorAction::ScrapePrice);
        assert_eq!(err.context.address.as_deref(), Some("0xabcd"));
        assert_eq!(err.context.block, Some(42));
        assert_eq!(err.to_string(), "price-not-found (scrape-price): no price for 0xABCD at block 42");
    }
}

//! Command line and environment configuration.

use clap::Parser;
use ripple_pg::DEFAULT_EVENTS_CHANNEL;

/// Forward audit events from a database to webhook endpoints.
#[derive(Parser, Clone, Debug)]
#[command(name = "ripple", version, about)]
pub struct Config {
    /// Database URL (postgresql://{user}:{password}@{hostname}/{db})
    #[arg(long = "db", env = "RIPPLE_DB_URI")]
    pub db_uri: String,

    /// Webhook URL for entity update events
    #[arg(long, env = "RIPPLE_UPDATE_ENTITY_URL")]
    pub update_entity_url: Option<String>,

    /// Webhook URL for new submission events
    #[arg(long, env = "RIPPLE_NEW_SUBMISSION_URL")]
    pub new_submission_url: Option<String>,

    /// Webhook URL for submission review events
    #[arg(long, env = "RIPPLE_REVIEW_SUBMISSION_URL")]
    pub review_submission_url: Option<String>,

    /// X-API-Key header value for authenticating with the webhook API
    #[arg(long, env = "RIPPLE_API_KEY")]
    pub api_key: Option<String>,

    /// Audit table the notify trigger is installed on
    #[arg(long, env = "RIPPLE_AUDIT_TABLE", default_value = "audits")]
    pub audit_table: String,

    /// Notification channel the trigger publishes to
    #[arg(long, env = "RIPPLE_CHANNEL", default_value = DEFAULT_EVENTS_CHANNEL)]
    pub channel: String,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl Config {
    /// The endpoint configured for an event type, if any.
    pub fn endpoint_for(&self, event_type: &str) -> Option<&str> {
        let url = match event_type {
            crate::parser::ACTION_ENTITY_UPDATE => &self.update_entity_url,
            crate::parser::ACTION_SUBMISSION_CREATE => &self.new_submission_url,
            crate::parser::ACTION_SUBMISSION_UPDATE => &self.review_submission_url,
            _ => &None,
        };
        url.as_deref()
    }

    /// Whether at least one webhook endpoint is configured.
    pub fn has_endpoints(&self) -> bool {
        self.update_entity_url.is_some()
            || self.new_submission_url.is_some()
            || self.review_submission_url.is_some()
    }
}

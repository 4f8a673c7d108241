pub mod notifier;
pub mod verifier;

pub use notifier::{DeliveryNotice, WebhookNotifier};
pub use verifier::{CredentialVerifier, StaticCredentialVerifier, VerifyError};

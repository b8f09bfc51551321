use async_trait::async_trait;
use tracing::info;

/// Outbound verification mail. Delivery is an external concern; the default
/// implementation only logs the link so the flow is testable end to end.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_verification(&self, email: &str, token: &str) -> anyhow::Result<()>;
}

pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_verification(&self, email: &str, token: &str) -> anyhow::Result<()> {
        info!(%email, "verification link: /api/v1/auth/verify-email?token={token}");
        Ok(())
    }
}

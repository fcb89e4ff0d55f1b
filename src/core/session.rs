use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::portal::{PageInteraction, PortalError, PortalResult, SessionFactory};

/// The one browsing session shared by all parties, plus the means to replace
/// it. Replacement only happens between two parties' checks.
pub struct Session {
    factory: Arc<dyn SessionFactory>,
    current: Option<Box<dyn PageInteraction>>,
    generation: u64,
    cooldown: Duration,
}

impl Session {
    pub async fn open(factory: Arc<dyn SessionFactory>, cooldown: Duration) -> PortalResult<Self> {
        let page = factory.create().await?;
        info!("Using {}", page.describe());
        Ok(Self {
            factory,
            current: Some(page),
            generation: 1,
            cooldown,
        })
    }

    /// Increases every time a new underlying session is created.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Returns the live session, creating one if the last recovery left the
    /// slot empty.
    pub async fn page(&mut self) -> PortalResult<&mut (dyn PageInteraction + 'static)> {
        if self.current.is_none() {
            let page = self.factory.create().await?;
            self.generation += 1;
            info!("Reopened {} (generation {})", page.describe(), self.generation);
            self.current = Some(page);
        }
        self.current
            .as_deref_mut()
            .ok_or(PortalError::SessionClosed)
    }

    /// Tears the session down, waits out the cooldown and starts over.
    pub async fn recover(&mut self) -> PortalResult<()> {
        warn!(
            "Resetting browser session and waiting {}s",
            self.cooldown.as_secs()
        );
        self.close().await;

        if !self.cooldown.is_zero() {
            sleep(self.cooldown).await;
        }

        let page = self.factory.create().await?;
        self.generation += 1;
        info!("Recovered with {} (generation {})", page.describe(), self.generation);
        self.current = Some(page);
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some(mut page) = self.current.take() {
            if let Err(e) = page.close().await {
                warn!("Failed to close browser session: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::ScriptedFactory;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_recover_replaces_session_after_cooldown() {
        let factory = ScriptedFactory::default();
        let mut session = Session::open(Arc::new(factory.clone()), Duration::from_secs(120))
            .await
            .unwrap();
        let before = session.page().await.unwrap().describe();

        let started = Instant::now();
        session.recover().await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(120));
        assert_eq!(session.generation(), 2);
        assert_eq!(factory.created(), 2);
        let after = session.page().await.unwrap().describe();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_failed_recovery_reopens_lazily() {
        let factory = ScriptedFactory::default();
        let mut session = Session::open(Arc::new(factory.clone()), Duration::ZERO)
            .await
            .unwrap();

        factory.fail_next(1);
        assert!(session.recover().await.is_err());
        assert!(!session.is_open());

        session.page().await.unwrap();
        assert!(session.is_open());
        assert_eq!(session.generation(), 2);
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_open_fails_when_factory_fails() {
        let factory = ScriptedFactory::default();
        factory.fail_next(1);
        assert!(Session::open(Arc::new(factory), Duration::ZERO).await.is_err());
    }
}

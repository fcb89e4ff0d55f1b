use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use super::classifier::{ErrorClassifier, ErrorKind};
use super::clock::{Clock, SystemClock};
use super::errors::MonitorResult;
use super::notify::{Audience, MailComposer, NotificationPolicy, Notice};
use super::party::{CheckOutcome, Cooldowns, Party};
use super::session::Session;
use crate::config::Config;
use crate::mail::{create_mailer, MailSender};
use crate::portal::{
    BookingFlow, Diagnostics, FlowTiming, HttpSessionFactory, InteractionSequence, MarkerTable,
    SessionFactory,
};
use crate::stats::StatsTracker;
use crate::storage::{ArtifactStore, StorageResult};

/// What one pass over all parties did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub checked: usize,
    pub skipped: usize,
    /// Parties that ended the pass with bookable slots or a fresh booking.
    pub slots_found: usize,
}

impl RoundReport {
    pub fn found_slot(&self) -> bool {
        self.slots_found > 0
    }
}

pub struct Monitor {
    parties: Vec<Party>,
    session: Session,
    flow: Box<dyn InteractionSequence>,
    classifier: ErrorClassifier,
    policy: NotificationPolicy,
    composer: MailComposer,
    mailer: Arc<dyn MailSender>,
    admin_email: Option<String>,
    artifacts: ArtifactStore,
    clock: Arc<dyn Clock>,
    cooldowns: Cooldowns,
    inter_party_delay: Duration,
    retry_interval: Duration,
    last_report: Option<RoundReport>,
    stats: StatsTracker,
}

impl Monitor {
    pub fn new(
        parties: Vec<Party>,
        session: Session,
        flow: Box<dyn InteractionSequence>,
        mailer: Arc<dyn MailSender>,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            parties,
            session,
            flow,
            classifier: ErrorClassifier::default(),
            policy: NotificationPolicy::default(),
            composer: MailComposer::default(),
            mailer,
            admin_email: None,
            artifacts,
            clock: Arc::new(SystemClock),
            cooldowns: Cooldowns::default(),
            inter_party_delay: Duration::from_secs(10),
            retry_interval: Duration::ZERO,
            last_report: None,
            stats: StatsTracker::new(),
        }
    }

    /// Wires the HTTP session, booking flow, mail transport and artifact
    /// directory described by `config`.
    pub async fn from_config(config: &Config, retry_interval: Duration) -> MonitorResult<Self> {
        let factory: Arc<dyn SessionFactory> =
            Arc::new(HttpSessionFactory::new(config.browser.clone()));
        let session = Session::open(factory, config.timing.rate_limit_cooldown()).await?;
        let flow = BookingFlow::new(MarkerTable::default(), FlowTiming::from(&config.timing));
        let mailer = create_mailer(&config.mail)?;
        let artifacts = ArtifactStore::new(&config.out_dir)?.with_retention(config.keep_artifacts);
        let parties = config.parties.iter().cloned().map(Party::new).collect();

        Ok(Self::new(parties, session, Box::new(flow), mailer, artifacts)
            .with_admin_email(config.admin_email.clone())
            .with_composer(MailComposer::new(config.mail.signature.as_str()))
            .with_policy(NotificationPolicy::new(config.timing.escalation_after()))
            .with_cooldowns(Cooldowns::from(&config.timing))
            .with_inter_party_delay(config.timing.inter_party_delay())
            .with_retry_interval(retry_interval))
    }

    pub fn with_policy(mut self, policy: NotificationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_composer(mut self, composer: MailComposer) -> Self {
        self.composer = composer;
        self
    }

    pub fn with_admin_email(mut self, admin_email: Option<String>) -> Self {
        self.admin_email = admin_email;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cooldowns(mut self, cooldowns: Cooldowns) -> Self {
        self.cooldowns = cooldowns;
        self
    }

    pub fn with_inter_party_delay(mut self, delay: Duration) -> Self {
        self.inter_party_delay = delay;
        self
    }

    /// Zero means a single round.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn parties(&self) -> &[Party] {
        &self.parties
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stats(&self) -> &StatsTracker {
        &self.stats
    }

    /// Report of the last round that ran to completion.
    pub fn last_report(&self) -> Option<RoundReport> {
        self.last_report
    }

    /// Runs rounds until the retry interval says stop, then closes the
    /// session and returns the report of the last round.
    pub async fn run(&mut self) -> RoundReport {
        match self.artifacts.clear_screenshots() {
            Ok(0) => {}
            Ok(n) => debug!("Removed {} screenshot(s) of a previous run", n),
            Err(e) => warn!("Unable to clear old screenshots: {}", e),
        }

        loop {
            let report = self.run_round().await;
            info!(
                "Round done: {} checked, {} skipped, {} with slots",
                report.checked, report.skipped, report.slots_found
            );
            self.last_report = Some(report);

            if self.retry_interval.is_zero() {
                self.shutdown().await;
                return report;
            }

            info!("Next round in {}s", self.retry_interval.as_secs());
            sleep(self.retry_interval).await;
        }
    }

    pub async fn shutdown(&mut self) {
        self.session.close().await;
        self.stats.finish();
        self.stats.log_summary();
    }

    pub async fn run_round(&mut self) -> RoundReport {
        let mut report = RoundReport::default();
        self.stats.record_round();

        for index in 0..self.parties.len() {
            let now = self.clock.now();
            let party = &self.parties[index];
            if !party.is_due(now, &self.cooldowns) {
                debug!("Skipping {} ({}), still in cooldown", party.name(), party.status());
                report.skipped += 1;
                self.stats.record_skip();
                continue;
            }

            match self.check_party(index).await {
                Some(outcome) => {
                    report.checked += 1;
                    if outcome.found_slot() {
                        report.slots_found += 1;
                    }
                }
                None => {
                    report.skipped += 1;
                    self.stats.record_skip();
                }
            }

            if !self.inter_party_delay.is_zero() {
                sleep(self.inter_party_delay).await;
            }
        }

        self.log_status();
        report
    }

    /// One full cycle for one party. `None` when no session could be had,
    /// in which case the party is left untouched.
    async fn check_party(&mut self, index: usize) -> Option<CheckOutcome> {
        let page = match self.session.page().await {
            Ok(page) => page,
            Err(e) => {
                warn!(
                    "Skipping {}: no browser session available ({})",
                    self.parties[index].name(),
                    e
                );
                return None;
            }
        };

        let party = &self.parties[index];
        info!("Checking {} (status={})", party.name(), party.status());
        let result = self.flow.check(&mut *page, party).await;
        let diagnostics = page.capture_diagnostics().await;

        let outcome = match result {
            Ok(flow_outcome) => CheckOutcome::from(flow_outcome),
            Err(failure) => {
                let classified = self.classifier.classify(&failure, diagnostics.last_severe());
                warn!("{}: {}", party.name(), classified);
                CheckOutcome::Failed(classified)
            }
        };

        let now = self.clock.now();
        let party = &mut self.parties[index];
        let transition = party.record_outcome(&outcome, now);
        if transition.old != transition.new {
            info!("{}: {} -> {}", party.name(), transition.old, transition.new);
        }
        let notices = self.policy.evaluate(party, &transition, &outcome, now);
        self.stats.record_check(outcome.label(), outcome.found_slot());

        let party = &self.parties[index];
        if let Err(e) = self.artifacts.save_snapshot(party.identifier(), &diagnostics) {
            warn!("Unable to save diagnostics of {}: {}", party.name(), e);
        }

        for notice in notices {
            self.dispatch(notice, party, &outcome, &diagnostics).await;
        }

        if outcome.error_kind() == Some(ErrorKind::RateLimited) {
            match self.session.recover().await {
                Ok(()) => self.stats.record_recovery(true),
                Err(e) => {
                    error!("Session recovery failed, retrying before the next party: {}", e);
                    self.stats.record_recovery(false);
                }
            }
        }

        Some(outcome)
    }

    async fn dispatch(
        &self,
        notice: Notice,
        party: &Party,
        outcome: &CheckOutcome,
        diagnostics: &Diagnostics,
    ) {
        self.stats.record_notice(notice.to_string());

        let recipient = match notice.audience() {
            Audience::Party => party.profile.recipient.as_str(),
            Audience::Admin => match self.admin_email.as_deref() {
                Some(admin) => admin,
                None => {
                    warn!("No admin address configured, dropping {} for {}", notice, party.name());
                    return;
                }
            },
        };

        let attachments = self
            .attachments_for(notice, party, diagnostics)
            .unwrap_or_else(|e| {
                warn!("Unable to store attachments for {}: {}", notice, e);
                Vec::new()
            });
        let mail = self
            .composer
            .compose(notice, party, recipient, outcome)
            .with_attachments(attachments);

        match self.mailer.send(&mail).await {
            Ok(()) => info!("Sent {} for {} to {}", notice, party.name(), recipient),
            Err(e) => {
                error!("Unable to send {} for {}: {}", notice, party.name(), e);
                self.stats.record_mail_failure();
            }
        }
    }

    fn attachments_for(
        &self,
        notice: Notice,
        party: &Party,
        diagnostics: &Diagnostics,
    ) -> StorageResult<Vec<PathBuf>> {
        match notice {
            Notice::SlotFound => {
                let mut paths = Vec::new();
                if let Some(png) = &diagnostics.screenshot {
                    paths.push(self.artifacts.save_screenshot(png)?);
                }
                paths.push(self.artifacts.save_page_source(party.identifier(), diagnostics)?);
                Ok(paths)
            }
            Notice::UnclassifiedAlert => {
                self.artifacts
                    .save_error_bundle(party.identifier(), diagnostics, self.clock.now())
            }
            Notice::ErrorEscalation => Ok(self.artifacts.snapshot_paths(party.identifier())),
            Notice::BookingConfirmed | Notice::Recovery => Ok(Vec::new()),
        }
    }

    fn log_status(&self) {
        for party in &self.parties {
            let last_check = party
                .state
                .last_check_timestamp
                .map(|at| at.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            debug!(
                "{:<24} {:<16} last check {}",
                party.name(),
                party.status().to_string(),
                last_check
            );
        }
    }
}

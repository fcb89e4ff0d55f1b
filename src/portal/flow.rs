use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use super::markers::{Marker, MarkerTable};
use super::{PageInteraction, PageObservation, PortalError, PortalResult, Step};
use crate::config::TimingConfig;
use crate::core::Party;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    NoSlot,
    SlotFound,
    Booked,
}

/// The two ways into the portal: with a reservation code, or through the
/// public waitlist that asks for the party's age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowVariant {
    Reservation,
    Waitlist,
}

impl FlowVariant {
    pub fn for_party(party: &Party) -> Self {
        if party.has_reservation_code() {
            FlowVariant::Reservation
        } else {
            FlowVariant::Waitlist
        }
    }
}

/// Runs one complete check for one party against a live session.
#[async_trait]
pub trait InteractionSequence: Send + Sync {
    async fn check(
        &self,
        page: &mut dyn PageInteraction,
        party: &Party,
    ) -> PortalResult<FlowOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTiming {
    pub settle: Duration,
    pub post_click: Duration,
    pub poll_interval: Duration,
    pub challenge_timeout: Duration,
    pub waiting_room_timeout: Duration,
}

impl Default for FlowTiming {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for FlowTiming {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            settle: Duration::from_secs(timing.settle_secs),
            post_click: Duration::from_secs(timing.post_click_secs),
            poll_interval: Duration::from_secs(timing.poll_interval_secs),
            challenge_timeout: Duration::from_secs(timing.challenge_timeout_secs),
            waiting_room_timeout: Duration::from_secs(timing.waiting_room_timeout_secs),
        }
    }
}

impl FlowTiming {
    pub fn immediate() -> Self {
        Self {
            settle: Duration::ZERO,
            post_click: Duration::ZERO,
            poll_interval: Duration::ZERO,
            challenge_timeout: Duration::ZERO,
            waiting_room_timeout: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BookingFlow {
    markers: MarkerTable,
    timing: FlowTiming,
}

impl BookingFlow {
    pub fn new(markers: MarkerTable, timing: FlowTiming) -> Self {
        Self { markers, timing }
    }

    pub fn with_timing(mut self, timing: FlowTiming) -> Self {
        self.timing = timing;
        self
    }

    async fn settle(&self, wait: Duration) {
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    async fn dismiss_cookie_banner(
        &self,
        page: &mut dyn PageInteraction,
        current: PageObservation,
    ) -> PortalResult<PageObservation> {
        if !self.markers.has(&current, Marker::CookieBanner) {
            return Ok(current);
        }
        debug!("Dismissing cookie banner");
        let observation = page.perform_step(&Step::DismissCookieBanner).await?;
        self.settle(self.timing.settle).await;
        Ok(observation)
    }

    /// Polls while `marker` is present; fails once `timeout` has passed.
    async fn wait_while(
        &self,
        page: &mut dyn PageInteraction,
        mut current: PageObservation,
        marker: Marker,
        timeout: Duration,
    ) -> PortalResult<PageObservation> {
        if !self.markers.has(&current, marker) {
            return Ok(current);
        }

        let step_name = self.markers.text(marker).to_string();
        info!("Waiting for \"{}\" to pass (timeout={}s)", step_name, timeout.as_secs());
        let deadline = Instant::now() + timeout;

        while self.markers.has(&current, marker) {
            self.settle(self.timing.poll_interval).await;
            if Instant::now() >= deadline {
                return Err(PortalError::domain(format!(
                    "Timeout in the \"{}\" step has occurred (timeout={}s)",
                    step_name,
                    timeout.as_secs()
                )));
            }
            current = page.perform_step(&Step::Poll).await?;
        }
        Ok(current)
    }

    /// Navigation, cookie banner, maintenance and the waiting room are the
    /// same for both variants.
    async fn enter(
        &self,
        page: &mut dyn PageInteraction,
        party: &Party,
    ) -> PortalResult<PageObservation> {
        let url = party
            .search_url()
            .map_err(|e| PortalError::domain(format!("Unable to build the search URL: {e}")))?;
        info!("[{}] #{} fetching {}", party.name(), party.status(), url);

        let current = page.navigate(&url).await?;
        self.settle(self.timing.settle).await;
        let current = self.dismiss_cookie_banner(page, current).await?;

        if self.markers.has(&current, Marker::Maintenance) {
            return Err(PortalError::domain("site is currently in maintenance mode"));
        }

        let current = self
            .wait_while(page, current, Marker::WaitingRoom, self.timing.waiting_room_timeout)
            .await?;
        self.dismiss_cookie_banner(page, current).await
    }

    /// The portal sometimes drops deep links on its landing page; one reload
    /// is tried before giving up.
    async fn ensure_not_bounced(
        &self,
        page: &mut dyn PageInteraction,
        party: &Party,
        current: PageObservation,
    ) -> PortalResult<PageObservation> {
        let landing = party
            .landing_url()
            .map_err(|e| PortalError::domain(format!("Unable to build the landing URL: {e}")))?;
        if current.url != landing {
            return Ok(current);
        }

        let url = party
            .search_url()
            .map_err(|e| PortalError::domain(format!("Unable to build the search URL: {e}")))?;
        info!("[{}] redirected to {}, reloading", party.name(), landing);
        let current = page.navigate(&url).await?;
        self.settle(self.timing.settle).await;

        if current.url == landing {
            return Err(PortalError::domain(format!(
                "Unable to access the page {url}, being redirected to {}",
                current.url
            )));
        }
        Ok(current)
    }

    fn expect_marker(&self, current: &PageObservation, marker: Marker) -> PortalResult<()> {
        if self.markers.has(current, marker) {
            Ok(())
        } else {
            Err(PortalError::domain(format!(
                "was expecting to see \"{}\" but this string was not found",
                self.markers.text(marker)
            )))
        }
    }

    async fn reservation(
        &self,
        page: &mut dyn PageInteraction,
        party: &Party,
        current: PageObservation,
    ) -> PortalResult<FlowOutcome> {
        let current = self
            .wait_while(page, current, Marker::Challenge, self.timing.challenge_timeout)
            .await?;
        let current = self.dismiss_cookie_banner(page, current).await?;
        let current = self.ensure_not_bounced(page, party, current).await?;

        if self.markers.has(&current, Marker::AlreadyScheduled) {
            return Err(PortalError::domain("appointment already scheduled"));
        }

        let current = self.dismiss_cookie_banner(page, current).await?;
        self.expect_marker(&current, Marker::SearchForm)?;

        let current = match page.perform_step(&Step::SearchAppointments).await {
            Ok(observation) => observation,
            Err(PortalError::ElementNotFound(selector)) => {
                warn!("[{}] parsing error ({} not found)", party.name(), selector);
                return Ok(FlowOutcome::NoSlot);
            }
            Err(e) => return Err(e),
        };
        self.settle(self.timing.post_click).await;
        let current = self.dismiss_cookie_banner(page, current).await?;

        if self.markers.has(&current, Marker::NoAppointments) {
            info!("[{}] no appointments available", party.name());
            return Ok(FlowOutcome::NoSlot);
        }
        if self.markers.has(&current, Marker::SearchPending) {
            info!("[{}] search did not finish in time", party.name());
            return Ok(FlowOutcome::NoSlot);
        }

        info!("[{}] at least one appointment found", party.name());
        Ok(FlowOutcome::SlotFound)
    }

    async fn waitlist(
        &self,
        page: &mut dyn PageInteraction,
        party: &Party,
        current: PageObservation,
    ) -> PortalResult<FlowOutcome> {
        let current = self.ensure_not_bounced(page, party, current).await?;
        self.expect_marker(&current, Marker::ClaimQuestion)?;

        let current = page.perform_step(&Step::DeclineClaim).await?;
        self.settle(self.timing.post_click).await;

        if self.markers.has(&current, Marker::NoFreeSlots) {
            info!("[{}] no appointments available (1)", party.name());
            return Ok(FlowOutcome::NoSlot);
        }
        self.expect_marker(&current, Marker::EligibleList)?;
        self.expect_marker(&current, Marker::GroupQuestion)?;

        let age = party
            .profile
            .age
            .ok_or_else(|| PortalError::domain("was expecting an age for the waitlist search"))?;

        page.perform_step(&Step::SelectEligibleGroup).await?;
        page.perform_step(&Step::EnterAge(age)).await?;
        self.settle(self.timing.settle).await;

        let current = page.perform_step(&Step::SubmitAge).await?;
        self.settle(self.timing.settle).await;

        if self.markers.has(&current, Marker::NoFreeSlots) {
            info!("[{}] no appointments available (2)", party.name());
            return Ok(FlowOutcome::NoSlot);
        }

        info!("[{}] at least one appointment found", party.name());
        Ok(FlowOutcome::SlotFound)
    }

    /// Books the first offered slot. Any failure leaves the slot reported
    /// as found so the party can still act on it.
    async fn try_book(&self, page: &mut dyn PageInteraction, party: &Party) -> FlowOutcome {
        let step = Step::Book(Box::new(party.profile.address.clone()));
        match page.perform_step(&step).await {
            Ok(current) => {
                self.settle(self.timing.post_click).await;
                if self.markers.has(&current, Marker::AlreadyScheduled) {
                    info!("[{}] booking confirmed", party.name());
                    FlowOutcome::Booked
                } else {
                    warn!("[{}] booking submitted but not confirmed", party.name());
                    FlowOutcome::SlotFound
                }
            }
            Err(e) => {
                warn!("[{}] booking failed: {}", party.name(), e);
                FlowOutcome::SlotFound
            }
        }
    }
}

#[async_trait]
impl InteractionSequence for BookingFlow {
    async fn check(
        &self,
        page: &mut dyn PageInteraction,
        party: &Party,
    ) -> PortalResult<FlowOutcome> {
        let current = self.enter(page, party).await?;

        let outcome = match FlowVariant::for_party(party) {
            FlowVariant::Reservation => self.reservation(page, party, current).await?,
            FlowVariant::Waitlist => self.waitlist(page, party, current).await?,
        };

        if outcome == FlowOutcome::SlotFound && party.profile.auto_book {
            return Ok(self.try_book(page, party).await);
        }
        Ok(outcome)
    }
}

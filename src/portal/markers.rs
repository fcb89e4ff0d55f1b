use super::PageObservation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    CookieBanner,
    Maintenance,
    WaitingRoom,
    Challenge,
    AlreadyScheduled,
    SearchForm,
    NoAppointments,
    SearchPending,
    ClaimQuestion,
    NoFreeSlots,
    EligibleList,
    GroupQuestion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerSource {
    Title,
    Body,
}

#[derive(Debug, Clone)]
pub struct MarkerRule {
    pub marker: Marker,
    pub source: MarkerSource,
    pub text: String,
}

/// Maps marker text on the portal to the page states the flow reacts to.
#[derive(Debug, Clone)]
pub struct MarkerTable {
    rules: Vec<MarkerRule>,
}

const DEFAULT_RULES: &[(Marker, MarkerSource, &str)] = &[
    (Marker::CookieBanner, MarkerSource::Body, "Cookie Hinweis"),
    (Marker::Maintenance, MarkerSource::Body, "Wartungsarbeiten"),
    (Marker::WaitingRoom, MarkerSource::Body, "Virtueller Warteraum"),
    (Marker::Challenge, MarkerSource::Title, "Challenge Validation"),
    (Marker::AlreadyScheduled, MarkerSource::Body, "Ihr Termin am"),
    (Marker::SearchForm, MarkerSource::Body, "Termine suchen"),
    (Marker::NoAppointments, MarkerSource::Body, "leider keine Termine"),
    (Marker::SearchPending, MarkerSource::Body, "Termine werden gesucht"),
    (Marker::ClaimQuestion, MarkerSource::Body, "Wurde Ihr Anspruch"),
    (Marker::NoFreeSlots, MarkerSource::Body, "Es wurden keine freien"),
    (Marker::EligibleList, MarkerSource::Body, "Folgende Personen"),
    (Marker::GroupQuestion, MarkerSource::Body, "Gehören Sie"),
];

impl Default for MarkerTable {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES
                .iter()
                .map(|(marker, source, text)| MarkerRule {
                    marker: *marker,
                    source: *source,
                    text: text.to_string(),
                })
                .collect(),
        }
    }
}

impl MarkerTable {
    /// Replaces the text of `marker`, keeping its source.
    pub fn with_text(mut self, marker: Marker, text: impl Into<String>) -> Self {
        let text = text.into();
        for rule in self.rules.iter_mut().filter(|r| r.marker == marker) {
            rule.text = text.clone();
        }
        self
    }

    pub fn text(&self, marker: Marker) -> &str {
        self.rules
            .iter()
            .find(|r| r.marker == marker)
            .map(|r| r.text.as_str())
            .unwrap_or_default()
    }

    pub fn has(&self, page: &PageObservation, marker: Marker) -> bool {
        self.rules.iter().filter(|r| r.marker == marker).any(|r| {
            let haystack = match r.source {
                MarkerSource::Title => &page.title,
                MarkerSource::Body => &page.body_text,
            };
            !r.text.is_empty() && haystack.contains(&r.text)
        })
    }

    pub fn detect(&self, page: &PageObservation) -> Vec<Marker> {
        let mut found: Vec<Marker> = Vec::new();
        for rule in &self.rules {
            if !found.contains(&rule.marker) && self.has(page, rule.marker) {
                found.push(rule.marker);
            }
        }
        found
    }
}

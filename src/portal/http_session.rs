use async_trait::async_trait;
use log::{debug, info};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, ClientBuilder, Method, RequestBuilder};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::{
    ConsoleEntry, Diagnostics, PageInteraction, PageObservation, PortalError, PortalResult,
    SessionFactory, Step,
};
use crate::config::BrowserConfig;

/// CSS selectors used to carry out each step on the portal's pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSelectors {
    pub dismiss_cookie_banner: String,
    pub search_appointments: String,
    pub decline_claim: String,
    pub select_eligible_group: String,
    pub age_input: String,
    pub submit_age: String,
    pub booking_form: String,
}

impl Default for StepSelectors {
    fn default() -> Self {
        Self {
            dismiss_cookie_banner: ".cookies-info-close".to_string(),
            search_appointments: "button.search-filter-button".to_string(),
            decline_claim: "app-corona-vaccination > div:nth-child(2) > div > div > label:nth-child(2) > span".to_string(),
            select_eligible_group: "app-corona-vaccination-no > form > div.form-group.d-flex.justify-content-center > div > div > label:nth-child(1) > span".to_string(),
            age_input: "input[name='age']".to_string(),
            submit_age: "app-corona-vaccination-no > form > div:nth-child(4) > button".to_string(),
            booking_form: "form".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct LoadedPage {
    url: Url,
    html: String,
}

/// What activating an element amounts to without a script engine.
#[derive(Debug, Clone, PartialEq)]
enum Activation {
    Follow(Url),
    Choose { name: String, value: String },
    Submit {
        method: Method,
        action: Url,
        fields: Vec<(String, String)>,
    },
}

/// A browsing session that speaks plain HTTP. It keeps cookies, follows
/// links and submits forms, and keeps a console log in the format a Chrome
/// session would produce for failed resource loads.
pub struct HttpSession {
    client: Client,
    jar: Arc<Jar>,
    selectors: StepSelectors,
    user_agent: String,
    current: Option<LoadedPage>,
    console: Vec<ConsoleEntry>,
    form_values: BTreeMap<String, String>,
}

impl HttpSession {
    pub fn new(config: &BrowserConfig) -> PortalResult<Self> {
        let jar = Arc::new(Jar::default());
        let client = ClientBuilder::new()
            .user_agent(config.user_agent.as_str())
            .cookie_provider(Arc::clone(&jar))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            jar,
            selectors: config.selectors.clone(),
            user_agent: config.user_agent.clone(),
            current: None,
            console: Vec::new(),
            form_values: BTreeMap::new(),
        })
    }

    fn current(&self) -> PortalResult<&LoadedPage> {
        self.current.as_ref().ok_or(PortalError::SessionClosed)
    }

    async fn load(&mut self, target: &Url, request: RequestBuilder) -> PortalResult<PageObservation> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.console
                    .push(ConsoleEntry::severe(format!("{target} - net::ERR_FAILED ({e})")));
                return Err(e.into());
            }
        };

        let status = response.status();
        let url = response.url().clone();
        if status.is_client_error() || status.is_server_error() {
            self.console.push(ConsoleEntry::severe(format!(
                "{url} - Failed to load resource: the server responded with a status of {} ({})",
                status.as_u16(),
                status.canonical_reason().unwrap_or_default()
            )));
        }
        debug!("Loaded {} (status={})", url, status.as_u16());

        let html = response.text().await?;
        let observation = observe(&url, &html);
        self.form_values.clear();
        self.current = Some(LoadedPage { url, html });
        Ok(observation)
    }

    async fn activate(&mut self, activation: Activation) -> PortalResult<PageObservation> {
        match activation {
            Activation::Follow(url) => {
                let request = self.client.get(url.clone());
                self.load(&url, request).await
            }
            Activation::Choose { name, value } => {
                debug!("Choosing {}={}", name, value);
                self.form_values.insert(name, value);
                self.reobserve()
            }
            Activation::Submit {
                method,
                mut action,
                fields,
            } => {
                debug!("Submitting {} {} with {} fields", method, action, fields.len());
                let request = if method == Method::POST {
                    self.client.post(action.clone()).form(&fields)
                } else {
                    action.set_query(None);
                    self.client.get(action.clone()).query(&fields)
                };
                self.load(&action, request).await
            }
        }
    }

    fn reobserve(&self) -> PortalResult<PageObservation> {
        let page = self.current()?;
        Ok(observe(&page.url, &page.html))
    }

    fn selector_for(&self, step: &Step) -> Option<&str> {
        let selector = match step {
            Step::Poll | Step::DismissCookieBanner => return None,
            Step::SearchAppointments => &self.selectors.search_appointments,
            Step::DeclineClaim => &self.selectors.decline_claim,
            Step::SelectEligibleGroup => &self.selectors.select_eligible_group,
            Step::EnterAge(_) => &self.selectors.age_input,
            Step::SubmitAge => &self.selectors.submit_age,
            Step::Book(_) => &self.selectors.booking_form,
        };
        Some(selector.as_str())
    }
}

#[async_trait]
impl PageInteraction for HttpSession {
    async fn navigate(&mut self, url: &Url) -> PortalResult<PageObservation> {
        let request = self.client.get(url.clone());
        self.load(url, request).await
    }

    async fn perform_step(&mut self, step: &Step) -> PortalResult<PageObservation> {
        match step {
            Step::Poll => {
                let url = self.current()?.url.clone();
                let request = self.client.get(url.clone());
                self.load(&url, request).await
            }
            // The banner is drawn by a script; there is nothing to click.
            Step::DismissCookieBanner => self.reobserve(),
            Step::EnterAge(age) => {
                let selector = self.selectors.age_input.clone();
                let name = input_name(self.current()?, &selector)?;
                self.form_values.insert(name, age.to_string());
                self.reobserve()
            }
            Step::Book(address) => {
                let selector = self.selectors.booking_form.clone();
                let mut values = self.form_values.clone();
                for (field, value) in address.form_fields() {
                    values.insert(field.to_string(), value.to_string());
                }
                let activation = plan_submit(self.current()?, &selector, &values)?;
                self.activate(activation).await
            }
            _ => {
                let selector = self
                    .selector_for(step)
                    .map(str::to_string)
                    .ok_or_else(|| PortalError::Unsupported(step.id().to_string()))?;
                let activation = plan_click(self.current()?, &selector, &self.form_values)?;
                self.activate(activation).await
            }
        }
    }

    async fn capture_diagnostics(&mut self) -> Diagnostics {
        let (page_source, cookies) = match &self.current {
            Some(page) => (page.html.clone(), cookie_pairs(&self.jar, &page.url)),
            None => (String::new(), Vec::new()),
        };

        Diagnostics {
            screenshot: None,
            page_source,
            console: std::mem::take(&mut self.console),
            cookies,
        }
    }

    async fn close(&mut self) -> PortalResult<()> {
        self.current = None;
        self.console.clear();
        self.form_values.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        format!("HTTP session ({})", self.user_agent)
    }
}

pub struct HttpSessionFactory {
    config: BrowserConfig,
}

impl HttpSessionFactory {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn create(&self) -> PortalResult<Box<dyn PageInteraction>> {
        let session = HttpSession::new(&self.config)?;
        info!("Opened {}", session.describe());
        Ok(Box::new(session))
    }
}

fn cookie_pairs(jar: &Jar, url: &Url) -> Vec<String> {
    jar.cookies(url)
        .and_then(|header| header.to_str().ok().map(str::to_string))
        .map(|header| header.split("; ").map(str::to_string).collect())
        .unwrap_or_default()
}

fn parse_selector(selector: &str) -> PortalResult<Selector> {
    Selector::parse(selector)
        .map_err(|e| PortalError::Unsupported(format!("invalid selector {selector}: {e:?}")))
}

fn observe(url: &Url, html: &str) -> PageObservation {
    let document = Html::parse_document(html);

    let title = Selector::parse("title")
        .ok()
        .and_then(|sel| document.select(&sel).next().map(|t| t.text().collect::<String>()))
        .unwrap_or_default();

    let body = Selector::parse("body")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .map(|body| body.text().collect::<Vec<_>>())
        .unwrap_or_else(|| document.root_element().text().collect());

    let body_text = body
        .iter()
        .flat_map(|chunk| chunk.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ");

    PageObservation::new(url.clone(), title.trim(), body_text)
}

fn find<'a>(document: &'a Html, selector: &str) -> PortalResult<ElementRef<'a>> {
    let sel = parse_selector(selector)?;
    document
        .select(&sel)
        .next()
        .ok_or_else(|| PortalError::ElementNotFound(selector.to_string()))
}

fn input_name(page: &LoadedPage, selector: &str) -> PortalResult<String> {
    let document = Html::parse_document(&page.html);
    let element = find(&document, selector)?;
    element
        .value()
        .attr("name")
        .map(str::to_string)
        .ok_or_else(|| PortalError::Unsupported(format!("{selector} has no name to fill in")))
}

/// The element itself followed by its ancestors, innermost first.
fn self_and_ancestors(element: ElementRef<'_>) -> impl Iterator<Item = ElementRef<'_>> {
    std::iter::once(element).chain(element.ancestors().filter_map(ElementRef::wrap))
}

fn enclosing_form(element: ElementRef<'_>) -> Option<ElementRef<'_>> {
    self_and_ancestors(element).find(|e| e.value().name() == "form")
}

fn input_type(element: &ElementRef<'_>) -> String {
    element
        .value()
        .attr("type")
        .unwrap_or("text")
        .to_ascii_lowercase()
}

fn choice_of(input: ElementRef<'_>) -> Option<Activation> {
    let name = input.value().attr("name")?;
    Some(Activation::Choose {
        name: name.to_string(),
        value: input.value().attr("value").unwrap_or("on").to_string(),
    })
}

fn label_target<'a>(document: &'a Html, label: ElementRef<'a>) -> Option<ElementRef<'a>> {
    if let Some(id) = label.value().attr("for") {
        let sel = Selector::parse(&format!("[id=\"{id}\"]")).ok()?;
        return document.select(&sel).next();
    }
    let sel = Selector::parse("input").ok()?;
    label.select(&sel).next()
}

fn plan_click(
    page: &LoadedPage,
    selector: &str,
    values: &BTreeMap<String, String>,
) -> PortalResult<Activation> {
    let document = Html::parse_document(&page.html);
    let element = find(&document, selector)?;

    for node in self_and_ancestors(element) {
        match node.value().name() {
            "a" => {
                if let Some(href) = node.value().attr("href") {
                    let url = page
                        .url
                        .join(href)
                        .map_err(|e| PortalError::Unsupported(format!("bad link {href}: {e}")))?;
                    return Ok(Activation::Follow(url));
                }
            }
            "label" => {
                if let Some(choice) = label_target(&document, node).and_then(choice_of) {
                    return Ok(choice);
                }
            }
            "input" => match input_type(&node).as_str() {
                "radio" | "checkbox" => {
                    if let Some(choice) = choice_of(node) {
                        return Ok(choice);
                    }
                }
                "submit" | "image" => {
                    if let Some(form) = enclosing_form(node) {
                        return Ok(submission(page, form, Some(node), values));
                    }
                }
                _ => {}
            },
            "button" => {
                let kind = node.value().attr("type").unwrap_or("submit");
                if kind.eq_ignore_ascii_case("submit") {
                    if let Some(form) = enclosing_form(node) {
                        return Ok(submission(page, form, Some(node), values));
                    }
                }
            }
            "form" => break,
            _ => {}
        }
    }

    Err(PortalError::Unsupported(format!(
        "{selector} cannot be activated without a script engine"
    )))
}

fn plan_submit(
    page: &LoadedPage,
    selector: &str,
    values: &BTreeMap<String, String>,
) -> PortalResult<Activation> {
    let document = Html::parse_document(&page.html);
    let element = find(&document, selector)?;
    let form = enclosing_form(element)
        .ok_or_else(|| PortalError::Unsupported(format!("{selector} is not inside a form")))?;
    Ok(submission(page, form, None, values))
}

fn submission(
    page: &LoadedPage,
    form: ElementRef<'_>,
    submitter: Option<ElementRef<'_>>,
    values: &BTreeMap<String, String>,
) -> Activation {
    let method = match form.value().attr("method") {
        Some(m) if m.eq_ignore_ascii_case("post") => Method::POST,
        _ => Method::GET,
    };
    let action = form
        .value()
        .attr("action")
        .filter(|a| !a.is_empty())
        .and_then(|a| page.url.join(a).ok())
        .unwrap_or_else(|| page.url.clone());

    let mut fields: Vec<(String, String)> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    if let Ok(sel) = Selector::parse("input[name], select[name], textarea[name]") {
        for control in form.select(&sel) {
            let Some(name) = control.value().attr("name") else {
                continue;
            };
            let value = match control.value().name() {
                "input" => match input_type(&control).as_str() {
                    "submit" | "button" | "image" | "reset" => continue,
                    "radio" | "checkbox" => {
                        if values.contains_key(name) || control.value().attr("checked").is_none() {
                            continue;
                        }
                        control.value().attr("value").unwrap_or("on").to_string()
                    }
                    _ => values
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| control.value().attr("value").unwrap_or("").to_string()),
                },
                "select" => values.get(name).cloned().unwrap_or_else(|| selected_option(control)),
                _ => values
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| control.text().collect()),
            };
            seen.insert(name.to_string());
            fields.push((name.to_string(), value));
        }
    }

    for (name, value) in values {
        if !seen.contains(name) {
            fields.push((name.clone(), value.clone()));
        }
    }

    if let Some(button) = submitter {
        if let Some(name) = button.value().attr("name") {
            let value = button.value().attr("value").unwrap_or("");
            fields.push((name.to_string(), value.to_string()));
        }
    }

    Activation::Submit {
        method,
        action,
        fields,
    }
}

fn selected_option(select: ElementRef<'_>) -> String {
    let Ok(sel) = Selector::parse("option") else {
        return String::new();
    };
    let options: Vec<_> = select.select(&sel).collect();
    options
        .iter()
        .find(|o| o.value().attr("selected").is_some())
        .or_else(|| options.first())
        .map(|o| {
            o.value()
                .attr("value")
                .map(str::to_string)
                .unwrap_or_else(|| o.text().collect::<String>().trim().to_string())
        })
        .unwrap_or_default()
}

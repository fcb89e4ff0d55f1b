use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use url::Url;

use super::{
    ConsoleEntry, Diagnostics, PageInteraction, PageObservation, PortalError, PortalResult,
    SessionFactory, Step,
};

/// One canned reply of a [`ScriptedSession`].
#[derive(Debug, Clone)]
pub enum Scripted {
    Page(PageObservation),
    Fail(PortalError),
}

impl Scripted {
    pub fn page(url: Url, title: &str, body: &str) -> Self {
        Scripted::Page(PageObservation::new(url, title, body))
    }

    pub fn fail(error: PortalError) -> Self {
        Scripted::Fail(error)
    }

    pub fn with_title(self, title: &str) -> Self {
        match self {
            Scripted::Page(mut page) => {
                page.title = title.to_string();
                Scripted::Page(page)
            }
            other => other,
        }
    }
}

/// Replays a fixed list of observations, one per navigation or step, and
/// records every call it receives.
#[derive(Debug, Clone)]
pub struct ScriptedSession {
    id: usize,
    replies: VecDeque<Scripted>,
    repeat_last: bool,
    last: Option<Scripted>,
    console: Vec<ConsoleEntry>,
    screenshot: Option<Vec<u8>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedSession {
    pub fn new(replies: Vec<Scripted>) -> Self {
        Self {
            id: 0,
            replies: replies.into(),
            repeat_last: false,
            last: None,
            console: Vec::new(),
            screenshot: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Keeps answering with the final reply once the script runs out.
    pub fn repeat_last(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    pub fn with_console(mut self, entries: Vec<ConsoleEntry>) -> Self {
        self.console = entries;
        self
    }

    pub fn with_screenshot(mut self, png: Vec<u8>) -> Self {
        self.screenshot = Some(png);
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn next_reply(&mut self, call: String) -> PortalResult<PageObservation> {
        self.calls.lock().push(call);

        let reply = match self.replies.pop_front() {
            Some(reply) => {
                self.last = Some(reply.clone());
                reply
            }
            None if self.repeat_last => self
                .last
                .clone()
                .ok_or_else(|| PortalError::Transport("script is empty".into()))?,
            None => return Err(PortalError::Transport("script exhausted".into())),
        };

        match reply {
            Scripted::Page(page) => Ok(page),
            Scripted::Fail(error) => Err(error),
        }
    }

    fn current_page(&self) -> Option<&PageObservation> {
        match &self.last {
            Some(Scripted::Page(page)) => Some(page),
            _ => None,
        }
    }
}

#[async_trait]
impl PageInteraction for ScriptedSession {
    async fn navigate(&mut self, url: &Url) -> PortalResult<PageObservation> {
        self.next_reply(format!("navigate {url}"))
    }

    async fn perform_step(&mut self, step: &Step) -> PortalResult<PageObservation> {
        self.next_reply(format!("step {}", step.id()))
    }

    async fn capture_diagnostics(&mut self) -> Diagnostics {
        self.calls.lock().push("capture_diagnostics".to_string());
        Diagnostics {
            screenshot: self.screenshot.clone(),
            page_source: self
                .current_page()
                .map(|p| p.body_text.clone())
                .unwrap_or_default(),
            console: std::mem::take(&mut self.console),
            cookies: Vec::new(),
        }
    }

    async fn close(&mut self) -> PortalResult<()> {
        self.calls.lock().push("close".to_string());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("scripted session #{}", self.id)
    }
}

/// Hands out scripted sessions in order; once the list is used up every new
/// session is an empty one.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFactory {
    sessions: Arc<Mutex<VecDeque<ScriptedSession>>>,
    created: Arc<Mutex<usize>>,
    fail_next: Arc<Mutex<usize>>,
}

impl ScriptedFactory {
    pub fn new(sessions: Vec<ScriptedSession>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(sessions.into())),
            ..Default::default()
        }
    }

    /// The next `count` calls to `create` fail.
    pub fn fail_next(&self, count: usize) {
        *self.fail_next.lock() = count;
    }

    pub fn created(&self) -> usize {
        *self.created.lock()
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn create(&self) -> PortalResult<Box<dyn PageInteraction>> {
        {
            let mut failures = self.fail_next.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(PortalError::Transport("browser failed to start".into()));
            }
        }

        let mut created = self.created.lock();
        *created += 1;
        let mut session = self
            .sessions
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedSession::new(Vec::new()));
        session.id = *created;
        Ok(Box::new(session))
    }
}

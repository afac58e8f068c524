//! Scripted in-memory page used by the tests.
//!
//! Models the report form closely enough to exercise the real code paths:
//! a frame hosting the controls, combo lists that only exist while open, a
//! searchable bank tree, checkbox groups, and postbacks that replace control
//! nodes so that old handles go stale. Reports are keyed by the selected
//! bank (or province when no bank is selected) and may span several pages.

use super::{Driver, ElementHandle, Session};
use crate::config::{ControlKind, ControlLocator, ControlSpec, FormConfig, Strategy, Timing};
use crate::coordinator::SessionLauncher;
use crate::error::{ScrapeError, ScrapeResult};
use crate::models::MONTHS;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub const TABS: [&str; 2] = ["BPR Konvensional", "BPR Syariah"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Frame,
    Tab,
    Trigger(&'static str),
    Item(&'static str),
    Input(&'static str),
    Search,
    Checkbox,
    Submit,
    Results,
    NextPage,
}

#[derive(Debug, Clone)]
struct Node {
    id: u64,
    key: String,
    role: Role,
    text: String,
    html: String,
    enabled: bool,
    checked: bool,
    alive: bool,
    in_frame: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    framed: bool,
    loaded: bool,
    depth: usize,
    next_id: u64,
    nodes: Vec<Node>,
    open_list: Option<&'static str>,
    search: String,
    selection: BTreeMap<&'static str, String>,
    checked: BTreeSet<usize>,
    provinces: Vec<String>,
    cities: HashMap<String, Vec<String>>,
    banks: HashMap<String, Vec<String>>,
    reports: HashMap<String, Vec<String>>,
    broken: HashMap<String, usize>,
    browser_lost: bool,
    page: usize,
    current_report: Option<String>,
    fail_navigate: bool,
    visited: Vec<String>,
    submits: Vec<BTreeMap<&'static str, String>>,
    closes: usize,
}

/// Cheap to clone; clones share one page.
#[derive(Clone, Default)]
pub struct FakeDriver {
    state: Arc<Mutex<FakeState>>,
}

// ── Test fixtures ─────────────────────────────────────────────────────────────

fn css(v: &str) -> Vec<Strategy> {
    vec![Strategy::css(v)]
}

/// Form description matching the fake's node keys.
pub fn test_form() -> FormConfig {
    FormConfig {
        frame: ControlLocator::new(css("iframe#report")),
        tab: Some(ControlSpec::new(ControlKind::Button, css("tab:{value}"))),
        month: Some(ControlSpec::combo(css("#month-trigger"), css(".month-item"))),
        year: Some(ControlSpec::new(ControlKind::Text, css("#year-input"))),
        province: Some(ControlSpec::combo(css("#province-trigger"), css(".province-item"))),
        city: Some(ControlSpec::combo(css("#city-trigger"), css(".city-item"))),
        bank: Some(ControlSpec::tree(css("#bank-trigger"), css("#bank-search"), css(".bank-item"))),
        report_types: Some(ControlSpec::new(ControlKind::Checkboxes, css(".report-checkbox"))),
        submit: ControlSpec::new(ControlKind::Button, css("#show-report")),
        results: ControlLocator::new(css("#report-table")),
        next_page: ControlLocator::new(css("#next-page")),
    }
}

/// Search-page layout: province typed into a text box, no frame.
pub fn test_search_form() -> FormConfig {
    FormConfig {
        frame: ControlLocator::default(),
        tab: None,
        month: None,
        year: None,
        province: Some(ControlSpec::new(ControlKind::Text, css("#province-input"))),
        city: None,
        bank: None,
        report_types: None,
        submit: ControlSpec::new(ControlKind::Button, css("#show-report")),
        results: ControlLocator::new(css("#report-table")),
        next_page: ControlLocator::new(css("#next-page")),
    }
}

/// A report table with a header row of `<th>` cells.
pub fn report_html(rows: &[[&str; 3]]) -> String {
    let mut html = String::from(
        "<table><tr><th>Pos</th><th>Posisi Terkini</th><th>Posisi Sebelumnya</th></tr>",
    );
    for r in rows {
        html.push_str(&format!("<tr><td>{}</td><td>{}</td><td>{}</td></tr>", r[0], r[1], r[2]));
    }
    html.push_str("</table>");
    html
}

impl FakeDriver {
    /// Framed report form, no data configured.
    pub fn with_form() -> Self {
        let driver = Self::default();
        driver.lock().framed = true;
        driver
    }

    /// Unframed search page.
    pub fn search_page() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_bank(&self, province: &str, city: &str, bank: &str) {
        let mut s = self.lock();
        if !s.provinces.iter().any(|p| p == province) {
            s.provinces.push(province.to_string());
        }
        let cities = s.cities.entry(province.to_string()).or_default();
        if !cities.iter().any(|c| c == city) {
            cities.push(city.to_string());
        }
        s.banks.entry(city.to_string()).or_default().push(bank.to_string());
    }

    pub fn add_province(&self, province: &str) {
        let mut s = self.lock();
        if !s.provinces.iter().any(|p| p == province) {
            s.provinces.push(province.to_string());
        }
    }

    /// Pages of container HTML served when `key` is submitted.
    pub fn set_report(&self, key: &str, pages: Vec<String>) {
        self.lock().reports.insert(key.to_string(), pages);
    }

    /// Reading the results container for `key` fails with a driver error.
    pub fn break_report(&self, key: &str) {
        self.lock().broken.insert(key.to_string(), usize::MAX);
    }

    /// Like [`break_report`](Self::break_report), for the first read only.
    pub fn break_report_once(&self, key: &str) {
        self.lock().broken.insert(key.to_string(), 1);
    }

    /// Every lookup fails from now on, as after a browser crash.
    pub fn lose_browser(&self) {
        self.lock().browser_lost = true;
    }

    pub fn fail_navigation(&self) {
        self.lock().fail_navigate = true;
    }

    pub fn visited(&self) -> Vec<String> {
        self.lock().visited.clone()
    }

    pub fn frame_depth(&self) -> usize {
        self.lock().depth
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    pub fn selection(&self, slot: &str) -> Option<String> {
        self.lock().selection.get(slot).cloned()
    }

    pub fn checked_boxes(&self) -> Vec<usize> {
        self.lock().checked.iter().copied().collect()
    }

    /// Selections captured at each submit, oldest first.
    pub fn submits(&self) -> Vec<BTreeMap<String, String>> {
        self.lock()
            .submits
            .iter()
            .map(|m| m.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
            .collect()
    }
}

/// Hands out sessions over clones of one fake page.
pub struct FakeLauncher {
    driver: Option<FakeDriver>,
    launches: AtomicUsize,
}

impl FakeLauncher {
    pub fn new(driver: FakeDriver) -> Self {
        Self {
            driver: Some(driver),
            launches: AtomicUsize::new(0),
        }
    }

    /// Every launch fails as if no browser were installed.
    pub fn failing() -> Self {
        Self {
            driver: None,
            launches: AtomicUsize::new(0),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionLauncher for FakeLauncher {
    async fn launch(&self) -> anyhow::Result<Session> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        match &self.driver {
            Some(driver) => Ok(Session::new(Box::new(driver.clone()), Timing::instant())),
            None => anyhow::bail!("No browser found"),
        }
    }
}

// ── Page model ────────────────────────────────────────────────────────────────

impl FakeState {
    fn spawn(&mut self, key: &str, role: Role, text: &str) -> u64 {
        self.next_id += 1;
        let in_frame = self.framed && role != Role::Frame;
        self.nodes.push(Node {
            id: self.next_id,
            key: key.to_string(),
            role,
            text: text.to_string(),
            html: String::new(),
            enabled: true,
            checked: false,
            alive: true,
            in_frame,
        });
        self.next_id
    }

    fn node(&self, el: ElementHandle) -> ScrapeResult<&Node> {
        match self.nodes.iter().find(|n| n.id == el.0) {
            Some(n) if n.alive => Ok(n),
            Some(n) => Err(ScrapeError::StaleReference(n.key.clone())),
            None => Err(ScrapeError::Driver(format!("unknown handle {}", el.0))),
        }
    }

    fn load(&mut self) {
        self.nodes.clear();
        self.open_list = None;
        self.search.clear();
        self.selection.clear();
        self.checked.clear();
        self.current_report = None;
        self.page = 0;
        self.depth = 0;
        self.loaded = true;
        if self.framed {
            self.spawn("iframe#report", Role::Frame, "");
        }
        self.spawn_controls();
    }

    fn spawn_controls(&mut self) {
        for tab in TABS {
            self.spawn(&format!("tab:{tab}"), Role::Tab, tab);
        }
        self.spawn("#month-trigger", Role::Trigger("month"), "");
        self.spawn("#province-trigger", Role::Trigger("province"), "");
        self.spawn("#city-trigger", Role::Trigger("city"), "");
        self.spawn("#bank-trigger", Role::Trigger("bank"), "");
        self.spawn("#bank-search", Role::Search, "");
        self.spawn("#year-input", Role::Input("year"), "");
        self.spawn("#province-input", Role::Input("province"), "");
        for i in 0..4 {
            self.spawn(".report-checkbox", Role::Checkbox, &format!("report {i}"));
        }
        self.spawn("#show-report", Role::Submit, "Tampilkan");
        let checked: Vec<usize> = self.checked.iter().copied().collect();
        let boxes: Vec<u64> = self
            .nodes
            .iter()
            .filter(|n| n.alive && n.role == Role::Checkbox)
            .map(|n| n.id)
            .collect();
        for (i, id) in boxes.into_iter().enumerate() {
            if let Some(n) = self.nodes.iter_mut().find(|n| n.id == id) {
                n.checked = checked.contains(&i);
            }
        }
    }

    /// Server round-trip: every control node is replaced.
    fn postback(&mut self) {
        for n in self.nodes.iter_mut() {
            if !matches!(n.role, Role::Frame | Role::Results | Role::NextPage) {
                n.alive = false;
            }
        }
        self.open_list = None;
        self.spawn_controls();
    }

    fn list_values(&self, list: &str) -> Vec<String> {
        match list {
            "month" => MONTHS.iter().map(|m| m.to_string()).collect(),
            "province" => self.provinces.clone(),
            "city" => self
                .selection
                .get("province")
                .and_then(|p| self.cities.get(p))
                .cloned()
                .unwrap_or_default(),
            "bank" => {
                let pool: Vec<String> = match self.selection.get("city") {
                    Some(city) => self.banks.get(city).cloned().unwrap_or_default(),
                    None => self.banks.values().flatten().cloned().collect(),
                };
                let needle = self.search.to_lowercase();
                pool.into_iter()
                    .filter(|b| b.to_lowercase().contains(&needle))
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    fn close_list(&mut self) {
        for n in self.nodes.iter_mut() {
            if matches!(n.role, Role::Item(_)) {
                n.alive = false;
            }
        }
        self.open_list = None;
    }

    fn show_list(&mut self, list: &'static str) {
        self.close_list();
        for value in self.list_values(list) {
            self.spawn(&format!(".{list}-item"), Role::Item(list), &value);
        }
        self.open_list = Some(list);
    }

    fn select(&mut self, slot: &'static str, value: String) {
        let dependents: &[&str] = match slot {
            "tab" => &["month", "year", "province", "city", "bank"],
            "province" => &["city", "bank"],
            "city" => &["bank"],
            _ => &[],
        };
        for d in dependents {
            self.selection.remove(d);
        }
        if slot == "tab" {
            self.checked.clear();
        }
        self.selection.insert(slot, value);
    }

    fn clear_results(&mut self) {
        for n in self.nodes.iter_mut() {
            if matches!(n.role, Role::Results | Role::NextPage) {
                n.alive = false;
            }
        }
    }

    fn show_page(&mut self) {
        self.clear_results();
        let Some(key) = self.current_report.clone() else { return };
        let Some(pages) = self.reports.get(&key).cloned() else { return };
        let Some(html) = pages.get(self.page).cloned() else { return };
        let id = self.spawn("#report-table", Role::Results, "");
        if let Some(n) = self.nodes.iter_mut().find(|n| n.id == id) {
            n.html = html;
        }
        let more = self.page + 1 < pages.len();
        let id = self.spawn("#next-page", Role::NextPage, "Next");
        if let Some(n) = self.nodes.iter_mut().find(|n| n.id == id) {
            n.enabled = more;
        }
    }

    fn submit(&mut self) {
        self.submits.push(self.selection.clone());
        let key = self
            .selection
            .get("bank")
            .or_else(|| self.selection.get("province"))
            .cloned();
        self.postback();
        self.current_report = key;
        self.page = 0;
        self.show_page();
    }
}

// ── Driver impl ───────────────────────────────────────────────────────────────

#[async_trait]
impl Driver for FakeDriver {
    async fn navigate(&self, url: &str) -> ScrapeResult<()> {
        let mut s = self.lock();
        s.visited.push(url.to_string());
        if s.fail_navigate {
            return Err(ScrapeError::Driver("net::ERR_CONNECTION_RESET".into()));
        }
        s.load();
        Ok(())
    }

    async fn find_all(&self, strategy: &Strategy) -> ScrapeResult<Vec<ElementHandle>> {
        let s = self.lock();
        if s.browser_lost {
            return Err(ScrapeError::Driver("Target closed".into()));
        }
        if !s.loaded {
            return Ok(Vec::new());
        }
        let inside = s.depth > 0;
        Ok(s.nodes
            .iter()
            .filter(|n| n.alive && n.key == strategy.value && n.in_frame == inside)
            .map(|n| ElementHandle(n.id))
            .collect())
    }

    async fn is_stale(&self, el: ElementHandle) -> ScrapeResult<bool> {
        let s = self.lock();
        Ok(!s.nodes.iter().any(|n| n.id == el.0 && n.alive))
    }

    async fn is_displayed(&self, el: ElementHandle) -> ScrapeResult<bool> {
        self.lock().node(el).map(|_| true)
    }

    async fn is_enabled(&self, el: ElementHandle) -> ScrapeResult<bool> {
        self.lock().node(el).map(|n| n.enabled)
    }

    async fn is_checked(&self, el: ElementHandle) -> ScrapeResult<bool> {
        self.lock().node(el).map(|n| n.checked)
    }

    async fn click(&self, el: ElementHandle) -> ScrapeResult<()> {
        let mut s = self.lock();
        let node = s.node(el)?.clone();
        match node.role {
            Role::Trigger(list) => {
                if s.open_list == Some(list) {
                    s.close_list();
                } else {
                    s.show_list(list);
                }
            }
            Role::Item(list) => {
                s.select(list, node.text.clone());
                s.postback();
            }
            Role::Tab => {
                s.select("tab", node.text.clone());
                s.postback();
            }
            Role::Checkbox => {
                let idx = s
                    .nodes
                    .iter()
                    .filter(|n| n.alive && n.role == Role::Checkbox)
                    .position(|n| n.id == el.0)
                    .unwrap_or(0);
                if !s.checked.remove(&idx) {
                    s.checked.insert(idx);
                }
                if let Some(n) = s.nodes.iter_mut().find(|n| n.id == el.0) {
                    n.checked = !n.checked;
                }
            }
            Role::Submit => s.submit(),
            Role::NextPage => {
                if node.enabled {
                    s.page += 1;
                    s.show_page();
                }
            }
            Role::Frame | Role::Results | Role::Input(_) | Role::Search => {}
        }
        Ok(())
    }

    async fn type_text(&self, el: ElementHandle, text: &str, commit: bool) -> ScrapeResult<()> {
        let mut s = self.lock();
        let node = s.node(el)?.clone();
        match node.role {
            Role::Search => {
                s.search = text.to_string();
                if let Some(list) = s.open_list {
                    s.show_list(list);
                }
            }
            Role::Input(slot) => {
                s.select(slot, text.to_string());
                if commit {
                    s.postback();
                }
            }
            _ => return Err(ScrapeError::Driver(format!("{} is not editable", node.key))),
        }
        Ok(())
    }

    async fn text(&self, el: ElementHandle) -> ScrapeResult<String> {
        self.lock().node(el).map(|n| n.text.trim().to_string())
    }

    async fn inner_html(&self, el: ElementHandle) -> ScrapeResult<String> {
        let mut s = self.lock();
        let node = s.node(el)?.clone();
        if node.role == Role::Results {
            if let Some(key) = s.current_report.clone() {
                if let Some(left) = s.broken.get_mut(&key).filter(|left| **left > 0) {
                    *left -= 1;
                    return Err(ScrapeError::Driver("Runtime.evaluate: context destroyed".into()));
                }
            }
        }
        Ok(node.html)
    }

    async fn options(&self, el: ElementHandle) -> ScrapeResult<Vec<String>> {
        self.lock().node(el).map(|_| Vec::new())
    }

    async fn select_option(&self, el: ElementHandle, _text: &str) -> ScrapeResult<bool> {
        self.lock().node(el).map(|_| false)
    }

    async fn enter_frame(&self, frame: &Strategy) -> ScrapeResult<bool> {
        let mut s = self.lock();
        let found = s.depth == 0
            && s
                .nodes
                .iter()
                .any(|n| n.alive && n.role == Role::Frame && n.key == frame.value);
        if found {
            s.depth += 1;
        }
        Ok(found)
    }

    async fn exit_frame(&self) -> ScrapeResult<()> {
        let mut s = self.lock();
        s.depth = s.depth.saturating_sub(1);
        Ok(())
    }

    async fn close(&self) -> ScrapeResult<()> {
        let mut s = self.lock();
        s.closes += 1;
        s.loaded = false;
        Ok(())
    }
}

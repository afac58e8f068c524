//! Form descriptions: which controls make up a report form and how to find them.
//!
//! Locators are plain configuration so that site drift (renamed ids, new
//! widget classes) is fixed in `config/local.toml` instead of in code.
//! A strategy value may contain `{value}`, substituted with the option
//! being selected (used for tab captions).

use crate::models::Dimension;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum By {
    Id,
    Css,
    Xpath,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Strategy {
    pub by: By,
    pub value: String,
}

impl Strategy {
    pub fn id(value: &str) -> Self {
        Self { by: By::Id, value: value.to_string() }
    }

    pub fn css(value: &str) -> Self {
        Self { by: By::Css, value: value.to_string() }
    }

    pub fn xpath(value: &str) -> Self {
        Self { by: By::Xpath, value: value.to_string() }
    }

    pub fn with_value(&self, value: &str) -> Self {
        Self {
            by: self.by,
            value: self.value.replace("{value}", value),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.by {
            By::Id => write!(f, "#{}", self.value),
            By::Css => write!(f, "css={}", self.value),
            By::Xpath => write!(f, "xpath={}", self.value),
        }
    }
}

/// A logical control mapped to strategies tried in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ControlLocator(pub Vec<Strategy>);

impl ControlLocator {
    pub fn new(strategies: Vec<Strategy>) -> Self {
        Self(strategies)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn strategies(&self) -> &[Strategy] {
        &self.0
    }

    pub fn with_value(&self, value: &str) -> Self {
        Self(self.0.iter().map(|s| s.with_value(value)).collect())
    }
}

impl fmt::Display for ControlLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|s| s.to_string()).collect();
        write!(f, "[{}]", parts.join(" | "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    /// Native `<select>`
    Select,
    /// Widget trigger opening a bound list
    Combo,
    /// Widget trigger opening a searchable tree
    Tree,
    /// Text input committed with Enter
    Text,
    /// Indexed checkbox group
    Checkboxes,
    /// Clickable element; tabs and submit
    Button,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ControlSpec {
    pub kind: ControlKind,
    #[serde(default)]
    pub locator: ControlLocator,
    #[serde(default)]
    pub trigger: ControlLocator,
    #[serde(default)]
    pub items: ControlLocator,
    #[serde(default)]
    pub search: ControlLocator,
    /// Present once the postback caused by this control has landed
    #[serde(default)]
    pub successor: ControlLocator,
}

impl ControlSpec {
    pub fn new(kind: ControlKind, locator: Vec<Strategy>) -> Self {
        Self {
            kind,
            locator: ControlLocator::new(locator),
            trigger: ControlLocator::default(),
            items: ControlLocator::default(),
            search: ControlLocator::default(),
            successor: ControlLocator::default(),
        }
    }

    pub fn combo(trigger: Vec<Strategy>, items: Vec<Strategy>) -> Self {
        Self {
            trigger: ControlLocator::new(trigger),
            items: ControlLocator::new(items),
            ..Self::new(ControlKind::Combo, vec![])
        }
    }

    pub fn tree(trigger: Vec<Strategy>, search: Vec<Strategy>, items: Vec<Strategy>) -> Self {
        Self {
            trigger: ControlLocator::new(trigger),
            search: ControlLocator::new(search),
            items: ControlLocator::new(items),
            ..Self::new(ControlKind::Tree, vec![])
        }
    }
}

/// All controls of one report form.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FormConfig {
    /// Sub-document hosting the form; empty means the top-level document
    #[serde(default)]
    pub frame: ControlLocator,
    pub tab: Option<ControlSpec>,
    pub month: Option<ControlSpec>,
    pub year: Option<ControlSpec>,
    pub province: Option<ControlSpec>,
    pub city: Option<ControlSpec>,
    pub bank: Option<ControlSpec>,
    pub report_types: Option<ControlSpec>,
    pub submit: ControlSpec,
    pub results: ControlLocator,
    /// Pagination control; empty when results fit one page
    #[serde(default)]
    pub next_page: ControlLocator,
}

impl FormConfig {
    pub fn control(&self, dim: Dimension) -> Option<&ControlSpec> {
        match dim {
            Dimension::Tab => self.tab.as_ref(),
            Dimension::Month => self.month.as_ref(),
            Dimension::Year => self.year.as_ref(),
            Dimension::Province => self.province.as_ref(),
            Dimension::City => self.city.as_ref(),
            Dimension::Bank => self.bank.as_ref(),
            Dimension::ReportTypes => self.report_types.as_ref(),
        }
    }
}

// ── Site defaults ─────────────────────────────────────────────────────────────

const BOUND_LIST_ITEMS: &str = "//li[@role='option' or contains(@class, 'x-boundlist-item')]";
const PLAIN_LIST_ITEMS: &str = "//ul[contains(@class, 'x-list-plain')]//li";

fn bound_list() -> Vec<Strategy> {
    vec![Strategy::xpath(BOUND_LIST_ITEMS), Strategy::xpath(PLAIN_LIST_ITEMS)]
}

fn arrow_trigger(id: &str, index: usize) -> Vec<Strategy> {
    vec![
        Strategy::id(id),
        Strategy::xpath(&format!(
            "(//div[contains(@class, 'x-form-arrow-trigger')])[{}]",
            index
        )),
    ]
}

/// The ExtJS report form on the financial-statement portal (cfs).
pub fn cfs_report_form() -> FormConfig {
    FormConfig {
        frame: ControlLocator::new(vec![
            Strategy::xpath("//iframe[contains(@src, 'Report')]"),
            Strategy::css("iframe"),
        ]),
        tab: Some(ControlSpec::new(
            ControlKind::Button,
            vec![Strategy::xpath(
                "//span[contains(@class, 'x-tab-inner') and contains(text(), '{value}')]\
                 /ancestor::span[contains(@class, 'x-tab-button')]",
            )],
        )),
        month: Some(ControlSpec::combo(arrow_trigger("ext-gen1050", 1), bound_list())),
        year: Some(ControlSpec::new(
            ControlKind::Text,
            vec![Strategy::id("Year-inputEl"), Strategy::xpath("//input[contains(@id, 'Year')]")],
        )),
        province: Some(ControlSpec::combo(arrow_trigger("ext-gen1059", 2), bound_list())),
        city: Some(ControlSpec::combo(arrow_trigger("ext-gen1064", 3), bound_list())),
        bank: Some(ControlSpec::tree(
            vec![Strategy::id("ext-gen1069")],
            vec![Strategy::id("BankCodeSearchField-inputEl")],
            vec![Strategy::xpath("//span[contains(@class, 'x-tree-node-text')]")],
        )),
        report_types: Some(ControlSpec::new(
            ControlKind::Checkboxes,
            vec![
                Strategy::xpath("//*[@role='checkbox' and contains(@class, 'x-tree-checkbox')]"),
                Strategy::css(".x-tree-checkbox"),
            ],
        )),
        submit: ControlSpec::new(
            ControlKind::Button,
            vec![
                Strategy::id("ShowReportButton-btnInnerEl"),
                Strategy::xpath("//span[contains(text(), 'Tampilkan')]"),
            ],
        ),
        results: ControlLocator::new(vec![
            Strategy::xpath("//div[contains(@class, 'x-grid-view')]"),
            Strategy::xpath("//div[contains(@id, 'table') or contains(@class, 'table')]"),
        ]),
        next_page: ControlLocator::default(),
    }
}

/// The IBPRS financial-data search page.
pub fn ibprs_form() -> FormConfig {
    FormConfig {
        frame: ControlLocator::default(),
        tab: None,
        month: None,
        year: None,
        province: Some(ControlSpec::new(ControlKind::Text, vec![Strategy::id("search_4")])),
        city: None,
        bank: None,
        report_types: None,
        submit: ControlSpec::new(ControlKind::Button, vec![Strategy::id("Cari")]),
        results: ControlLocator::new(vec![Strategy::css("tbody.fs-7")]),
        next_page: ControlLocator::new(vec![
            Strategy::xpath("//i[contains(@class, 'next')]/.."),
            Strategy::css("i.next"),
        ]),
    }
}

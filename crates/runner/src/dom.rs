//! A handful of generic document scripts. They only read or poke elements;
//! every decision about what a label means is made in Rust on the snapshots.

use crate::normalize::normalize;
use crate::page::{Page, PageError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

const SNAPSHOT_SCRIPT: &str = r#"
const [selector, contextSel, limit] = arguments;
const attrNames = ['href', 'title', 'alt', 'name', 'id', 'type', 'onclick', 'max',
  'data-unit', 'data-unitid', 'data-x', 'data-y', 'data-coord', 'data-did',
  'data-id', 'data-slotid', 'aria-disabled', 'placeholder'];
const out = [];
const nodes = Array.from(document.querySelectorAll(selector));
for (let i = 0; i < nodes.length && out.length < limit; i++) {
  const el = nodes[i];
  const attrs = {};
  for (const n of attrNames) {
    const v = el.getAttribute(n);
    if (v !== null) attrs[n] = v;
  }
  const ctx = contextSel ? el.closest(contextSel) : null;
  const img = (ctx || el).querySelector('img');
  out.push({
    index: i,
    tag: el.tagName.toLowerCase(),
    text: (el.innerText || el.textContent || '').trim(),
    value: el.value === undefined || el.value === null ? '' : String(el.value),
    class: typeof el.className === 'string' ? el.className : '',
    attrs,
    in_context: !!ctx,
    context: ctx ? (ctx.innerText || ctx.textContent || '') : '',
    image_alt: img ? (img.getAttribute('alt') || img.getAttribute('title') || '') : '',
    disabled: !!el.disabled
  });
}
return out;
"#;

const CLICK_SCRIPT: &str = r#"
const [selector, index] = arguments;
const el = document.querySelectorAll(selector)[index];
if (!el) return false;
if (typeof el.scrollIntoView === 'function') el.scrollIntoView({ block: 'center' });
el.click();
return true;
"#;

const FILL_SCRIPT: &str = r#"
const [selector, index, value] = arguments;
const el = document.querySelectorAll(selector)[index];
if (!el) return false;
el.focus();
el.value = value;
for (const kind of ['input', 'change', 'blur']) {
  el.dispatchEvent(new Event(kind, { bubbles: true }));
}
return true;
"#;

const SELECT_OPTION_SCRIPT: &str = r#"
const [selector, index] = arguments;
const opt = document.querySelectorAll(selector)[index];
const sel = opt ? opt.closest('select') : null;
if (!sel) return false;
sel.value = opt.value;
sel.dispatchEvent(new Event('change', { bubbles: true }));
return true;
"#;

const FORM_BUTTONS_SCRIPT: &str = r#"
const [selector, index] = arguments;
const input = document.querySelectorAll(selector)[index];
if (!input) return null;
const form = input.closest('form') || document.querySelector('form[action*="train"]');
if (!form) return null;
return Array.from(form.querySelectorAll('button, input[type="submit"]')).map((b, i) => ({
  index: i,
  tag: b.tagName.toLowerCase(),
  text: (b.innerText || '').trim(),
  value: b.value === undefined || b.value === null ? '' : String(b.value),
  class: typeof b.className === 'string' ? b.className : '',
  attrs: { type: (b.getAttribute('type') || '').toLowerCase() },
  disabled: !!b.disabled
}));
"#;

const SUBMIT_FORM_SCRIPT: &str = r#"
const [selector, index, buttonIndex] = arguments;
const input = document.querySelectorAll(selector)[index];
if (!input) return false;
const form = input.closest('form') || document.querySelector('form[action*="train"]');
if (!form) return false;
const btn = form.querySelectorAll('button, input[type="submit"]')[buttonIndex];
if (!btn) return false;
if (typeof btn.scrollIntoView === 'function') btn.scrollIntoView({ block: 'center' });
btn.click();
const isSubmit = (btn.getAttribute('type') || '').toLowerCase() === 'submit';
if (typeof form.requestSubmit === 'function') {
  if (isSubmit) form.requestSubmit(btn); else form.requestSubmit();
} else if (typeof form.submit === 'function') {
  form.submit();
}
return true;
"#;

const TEXT_SCRIPT: &str = r#"
const el = document.querySelector(arguments[0]);
return el ? (el.innerText || el.textContent || '') : null;
"#;

const EXISTS_SCRIPT: &str = "return document.querySelector(arguments[0]) !== null;";

const BODY_CLASS_SCRIPT: &str =
    "return document.body && document.body.className ? String(document.body.className) : '';";

const SNAPSHOT_LIMIT: usize = 600;

/// One element as the page reported it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ElementSnapshot {
    /// Position in the `querySelectorAll` result it was taken from.
    pub index: usize,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    /// Whether the element sits inside the requested context selector.
    #[serde(default)]
    pub in_context: bool,
    /// Inner text of that closest context ancestor.
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub image_alt: String,
    #[serde(default)]
    pub disabled: bool,
}

impl ElementSnapshot {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Normalized visible label: inner text, or the value for inputs.
    pub fn label(&self) -> String {
        if self.text.trim().is_empty() {
            normalize(&self.value)
        } else {
            normalize(&self.text)
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
            || normalize(&self.class).contains("disabled")
            || self.attr("aria-disabled") == Some("true")
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value, what: &str) -> Result<T, PageError> {
    serde_json::from_value(value).map_err(|e| PageError::Protocol(format!("{what}: {e}")))
}

pub async fn snapshot<P: Page + ?Sized>(
    page: &P,
    selector: &str,
    context: Option<&str>,
) -> Result<Vec<ElementSnapshot>, PageError> {
    let v = page
        .evaluate(
            SNAPSHOT_SCRIPT,
            vec![json!(selector), json!(context), json!(SNAPSHOT_LIMIT)],
        )
        .await?;
    if v.is_null() {
        return Ok(Vec::new());
    }
    decode(v, "snapshot")
}

pub async fn click_nth<P: Page + ?Sized>(
    page: &P,
    selector: &str,
    index: usize,
) -> Result<bool, PageError> {
    let v = page
        .evaluate(CLICK_SCRIPT, vec![json!(selector), json!(index)])
        .await?;
    Ok(v.as_bool().unwrap_or(false))
}

pub async fn fill_nth<P: Page + ?Sized>(
    page: &P,
    selector: &str,
    index: usize,
    value: &str,
) -> Result<bool, PageError> {
    let v = page
        .evaluate(FILL_SCRIPT, vec![json!(selector), json!(index), json!(value)])
        .await?;
    Ok(v.as_bool().unwrap_or(false))
}

pub async fn select_option<P: Page + ?Sized>(
    page: &P,
    option_selector: &str,
    index: usize,
) -> Result<bool, PageError> {
    let v = page
        .evaluate(SELECT_OPTION_SCRIPT, vec![json!(option_selector), json!(index)])
        .await?;
    Ok(v.as_bool().unwrap_or(false))
}

/// Buttons of the form enclosing the n-th `input_selector` match; `None` without a form.
pub async fn form_buttons<P: Page + ?Sized>(
    page: &P,
    input_selector: &str,
    index: usize,
) -> Result<Option<Vec<ElementSnapshot>>, PageError> {
    let v = page
        .evaluate(FORM_BUTTONS_SCRIPT, vec![json!(input_selector), json!(index)])
        .await?;
    if v.is_null() {
        return Ok(None);
    }
    decode(v, "form buttons").map(Some)
}

pub async fn submit_form<P: Page + ?Sized>(
    page: &P,
    input_selector: &str,
    index: usize,
    button_index: usize,
) -> Result<bool, PageError> {
    let v = page
        .evaluate(
            SUBMIT_FORM_SCRIPT,
            vec![json!(input_selector), json!(index), json!(button_index)],
        )
        .await?;
    Ok(v.as_bool().unwrap_or(false))
}

pub async fn text<P: Page + ?Sized>(page: &P, selector: &str) -> Result<Option<String>, PageError> {
    let v = page.evaluate(TEXT_SCRIPT, vec![json!(selector)]).await?;
    Ok(v.as_str().map(str::to_string))
}

pub async fn exists<P: Page + ?Sized>(page: &P, selector: &str) -> Result<bool, PageError> {
    let v = page.evaluate(EXISTS_SCRIPT, vec![json!(selector)]).await?;
    Ok(v.as_bool().unwrap_or(false))
}

pub async fn body_class<P: Page + ?Sized>(page: &P) -> Result<String, PageError> {
    let v = page.evaluate(BODY_CLASS_SCRIPT, Vec::new()).await?;
    Ok(v.as_str().unwrap_or_default().to_string())
}

//! Structured error values returned by the sandbox
//!
//! Every failure is reported as data; nothing raised inside the VM reaches
//! the host as an error.

use once_cell::sync::Lazy;
use regex::Regex;
use rquickjs::{Ctx, Value};
use serde_json::{json, Map, Value as Json};

use super::marshal::js_to_json;
use crate::constants::sandbox::{MAIN_MODULE, SCRIPT_FILE};

/// `file:line[:column]` inside a stack frame.
static FRAME_LOCATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z0-9_.<>\-]+):(\d+)(?::(\d+))?").unwrap());

/// `throw` statements in the submitted source.
static THROW_SITE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(^|[^\w$.])throw\b").unwrap());

/// QuickJS wording for unresolved identifiers.
static NOT_DEFINED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^'([^']+)' is not defined$").unwrap());

pub(crate) enum Failure {
    Timeout,
    ModuleNotFound(String),
    Guest(GuestError),
    Engine(String),
}

impl Failure {
    pub(crate) fn into_value(self, timeout_ms: u64) -> Json {
        match self {
            Failure::Timeout => timeout(timeout_ms),
            Failure::ModuleNotFound(name) => json!({ "error": format!("Module not found: {name}") }),
            Failure::Guest(error) => error.into_value(),
            Failure::Engine(message) => json!({ "error": message, "name": "InternalError" }),
        }
    }
}

pub(crate) fn timeout(timeout_ms: u64) -> Json {
    json!({
        "error": format!("Execution timed out after {timeout_ms}ms"),
        "timeout": true
    })
}

/// An exception thrown by guest code, localized in the submitted source.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GuestError {
    pub message: String,
    pub name: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub context: Option<String>,
    pub stack: Option<String>,
}

impl GuestError {
    fn into_value(self) -> Json {
        let mut map = Map::new();
        map.insert("error".into(), Json::String(self.message));
        map.insert("name".into(), Json::String(self.name));
        map.insert("line".into(), self.line.map(Json::from).unwrap_or(Json::Null));
        map.insert("column".into(), self.column.map(Json::from).unwrap_or(Json::Null));
        if let Some(context) = self.context {
            map.insert("context".into(), Json::String(context));
        }
        if let Some(stack) = self.stack.filter(|s| !s.trim().is_empty()) {
            map.insert("stack".into(), Json::String(stack));
        }
        Json::Object(map)
    }
}

/// Take the pending exception out of `ctx` and describe it.
pub(crate) fn capture(ctx: &Ctx<'_>, code: &str, max_depth: usize) -> GuestError {
    let thrown: Value = ctx.catch();
    let (name, message, stack, line_prop, column_prop) = match thrown.as_object() {
        Some(object) if thrown.is_error() => (
            object.get::<_, Option<String>>("name").ok().flatten(),
            object.get::<_, Option<String>>("message").ok().flatten(),
            object.get::<_, Option<String>>("stack").ok().flatten(),
            object.get::<_, Option<usize>>("lineNumber").ok().flatten(),
            object.get::<_, Option<usize>>("columnNumber").ok().flatten(),
        ),
        _ => (None, None, None, None, None),
    };
    let message = message.unwrap_or_else(|| describe_thrown(&thrown, max_depth));
    let name = name.unwrap_or_else(|| "Error".to_string());
    localize(code, name, message, stack, line_prop, column_prop)
}

fn describe_thrown(thrown: &Value<'_>, max_depth: usize) -> String {
    match js_to_json(thrown, max_depth) {
        Json::String(text) => text,
        other => other.to_string(),
    }
}

fn localize(
    code: &str,
    name: String,
    message: String,
    stack: Option<String>,
    line_prop: Option<usize>,
    column_prop: Option<usize>,
) -> GuestError {
    // Only frames in the submitted source count; a fault inside an imported
    // module is reported at the call site that reached it. Values thrown
    // without a stack fall back to the sole `throw` in the source, if any.
    let location = match stack.as_deref() {
        Some(stack) if FRAME_LOCATION.is_match(stack) => stack_location(stack),
        Some(_) => line_prop.map(|line| (line, column_prop)),
        None => line_prop
            .map(|line| (line, column_prop))
            .or_else(|| sole_throw_site(code)),
    };
    let (line, frame_column) = location
        .filter(|(line, _)| *line >= 1)
        .map_or((None, None), |(line, column)| (Some(line), column));
    let source_line = line.and_then(|l| code.lines().nth(l - 1));

    let identifier_column = NOT_DEFINED
        .captures(&message)
        .and_then(|caps| caps.get(1))
        .zip(source_line)
        .and_then(|(ident, text)| identifier_position(text, ident.as_str()));
    let column = identifier_column.or(frame_column).or(line.map(|_| 1));

    GuestError {
        message,
        name,
        line,
        column,
        context: source_line.map(str::to_string),
        stack,
    }
}

/// First frame of a QuickJS stack trace that lies in the submitted source.
fn stack_location(stack: &str) -> Option<(usize, Option<usize>)> {
    stack.lines().find_map(|frame| {
        let caps = FRAME_LOCATION.captures(frame)?;
        let file = caps.get(1)?.as_str();
        if file != MAIN_MODULE && file != SCRIPT_FILE {
            return None;
        }
        let line = caps.get(2)?.as_str().parse().ok()?;
        let column = caps.get(3).and_then(|c| c.as_str().parse().ok());
        Some((line, column))
    })
}

/// Line and column of the only `throw` in `code`.
fn sole_throw_site(code: &str) -> Option<(usize, Option<usize>)> {
    let mut sites = code.lines().enumerate().flat_map(|(index, text)| {
        THROW_SITE.captures_iter(text).filter_map(move |caps| {
            let start = caps.get(1)?.end();
            Some((index + 1, Some(text[..start].chars().count() + 1)))
        })
    });
    let site = sites.next()?;
    sites.next().is_none().then_some(site)
}

/// 1-based character column of the first whole-word occurrence.
fn identifier_position(line: &str, ident: &str) -> Option<usize> {
    let pattern = Regex::new(&format!(r"(^|[^\w$]){}($|[^\w$])", regex::escape(ident))).ok()?;
    let found = pattern.captures(line)?;
    let start = found.get(1)?.end();
    Some(line[..start].chars().count() + 1)
}

//! Configuration placeholder resolution
//!
//! Walks the configuration document and replaces `${vault(ref)}`
//! occurrences: a string that is exactly one placeholder takes the fetched
//! value itself; placeholders embedded in longer strings are resolved
//! individually and spliced back in. Resolution is idempotent, since a
//! resolved document contains no placeholders.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use super::httpsend::{self, HostCredentials};
use super::vault::SecretSource;
use super::{EkmError, SecretRef, VaultConfig};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{vault\(([^)]+)\)\}").expect("placeholder regex"));
static FULL_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$\{vault\(([^)]+)\)\}$").expect("full placeholder regex"));

/// Outcome of a resolution pass.
#[derive(Debug, Default)]
pub struct ResolveReport {
    /// Sites left unresolved under the lenient policy
    pub warnings: Vec<String>,
    /// Number of placeholders replaced
    pub resolved: usize,
}

/// Resolve every placeholder in `document`.
///
/// With `lenient` set, a failing site logs a warning and keeps its
/// placeholder; otherwise the first failure aborts.
///
/// # Errors
/// Propagates fetch failures at any site when not lenient.
pub async fn resolve_placeholders(
    document: &mut Value,
    source: &dyn SecretSource,
    lenient: bool,
) -> Result<ResolveReport, EkmError> {
    let mut report = ResolveReport::default();

    let mut sites = Vec::new();
    collect_string_sites(document, String::new(), &mut sites);

    for (pointer, original) in sites {
        match resolve_string(&original, source).await {
            Ok(Some(replacement)) => {
                if let Some(slot) = document.pointer_mut(&pointer) {
                    *slot = replacement;
                    report.resolved += 1;
                }
            }
            Ok(None) => {}
            Err(err) => {
                if !lenient {
                    return Err(err);
                }
                warn!(site = %pointer, error = %err, "leaving unresolved placeholder in place");
                report.warnings.push(format!("{pointer}: {err}"));
            }
        }
    }
    Ok(report)
}

/// Resolve the `services` / `keys` / `httpsend` override maps of the vault
/// section: overrides are written into `document`, and the outbound-HTTP
/// credential registry is swapped to the newly resolved set.
///
/// Override sites are required: any failure here aborts.
///
/// # Errors
/// Propagates reference parse and fetch failures.
pub async fn resolve_vault_section(
    document: &mut Value,
    vault: &VaultConfig,
    source: &dyn SecretSource,
) -> Result<(), EkmError> {
    for (site, reference) in &vault.services {
        let value = fetch_ref(reference, source).await?;
        write_override(document, "services", site, value);
    }
    for (site, reference) in &vault.keys {
        let value = fetch_ref(reference, source).await?;
        write_override(document, "keys", site, value);
    }

    let mut credentials = HashMap::new();
    for (origin, entry) in &vault.httpsend {
        let mut fields = BTreeMap::new();
        for (name, reference) in &entry.fields {
            let value = fetch_ref(reference, source).await?;
            fields.insert(name.clone(), render_scalar(&value));
        }

        let mut headers = BTreeMap::new();
        if entry.headers.is_empty() {
            if let Some(bearer) = fields.get("bearer") {
                headers.insert("Authorization".to_string(), format!("Bearer {bearer}"));
            }
        } else {
            for (name, template) in &entry.headers {
                let mut rendered = template.clone();
                for (field, value) in &fields {
                    rendered = rendered.replace(&format!("{{{field}}}"), value);
                }
                headers.insert(name.clone(), rendered);
            }
        }
        credentials.insert(origin.clone(), HostCredentials { headers });
    }
    httpsend::configure(credentials);
    Ok(())
}

async fn fetch_ref(reference: &str, source: &dyn SecretSource) -> Result<Value, EkmError> {
    let parsed: SecretRef = reference.parse()?;
    source.fetch(&parsed).await
}

/// Resolve one string leaf; `None` means it held no placeholder.
async fn resolve_string(
    original: &str,
    source: &dyn SecretSource,
) -> Result<Option<Value>, EkmError> {
    if let Some(captures) = FULL_PLACEHOLDER.captures(original) {
        let value = fetch_ref(&captures[1], source).await?;
        return Ok(Some(value));
    }
    if !PLACEHOLDER.is_match(original) {
        return Ok(None);
    }

    let mut rendered = String::with_capacity(original.len());
    let mut last = 0;
    for captures in PLACEHOLDER.captures_iter(original) {
        let whole = captures.get(0).map_or(original.len()..original.len(), |m| m.range());
        rendered.push_str(&original[last..whole.start]);
        let value = fetch_ref(&captures[1], source).await?;
        rendered.push_str(&render_scalar(&value));
        last = whole.end;
    }
    rendered.push_str(&original[last..]);
    Ok(Some(Value::String(rendered)))
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn collect_string_sites(value: &Value, pointer: String, out: &mut Vec<(String, String)>) {
    match value {
        Value::String(s) => {
            if PLACEHOLDER.is_match(s) {
                out.push((pointer, s.clone()));
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                let escaped = key.replace('~', "~0").replace('/', "~1");
                collect_string_sites(child, format!("{pointer}/{escaped}"), out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                collect_string_sites(child, format!("{pointer}/{index}"), out);
            }
        }
        _ => {}
    }
}

fn write_override(document: &mut Value, section: &str, site: &str, value: Value) {
    let Some((name, field)) = site.split_once('.') else {
        return;
    };
    if !document.is_object() {
        return;
    }
    if let Value::Object(root) = document {
        let section = root
            .entry(section.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Value::Object(section) = section {
            let entry = section
                .entry(name.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Value::Object(entry) = entry {
                entry.insert(field.to_string(), value);
            }
        }
    }
}

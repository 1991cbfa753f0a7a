use crate::descriptor::{MethodDescriptor, ServiceDescriptor};
use crate::error::Error;

use std::collections::HashMap;

use busrpc_messaging::subject::{Subject, WILDCARD_ONE};

const SERVICE_TOKEN: &str = "service";
const SERVICE_SUFFIX: &str = "Service";

/// Lowercases all-uppercase words and folds a leading acronym into a single
/// capitalised word, keeping the capital that starts the next word:
/// `PKGFarAway` becomes `PkgFarAway`.
pub fn normalize_pascal_case(word: &str) -> String {
    if word.to_uppercase() == word {
        return word.to_lowercase();
    }

    let run = word.chars().take_while(|c| c.is_uppercase()).count();
    if run <= 1 {
        return word.to_string();
    }

    let mut normalized = String::with_capacity(word.len());
    for (i, c) in word.chars().enumerate() {
        if i == 0 || i >= run - 1 {
            normalized.push(c);
        } else {
            normalized.extend(c.to_lowercase());
        }
    }
    normalized
}

/// Splits a Pascal or camel case word into lowercase tokens.
pub fn split_pascal_case(word: &str) -> Vec<String> {
    let normalized = normalize_pascal_case(word);

    let mut tokens = Vec::new();
    let mut start = 0;
    for (i, c) in normalized.char_indices() {
        if i > 0 && c.is_uppercase() {
            push_lowercase(&mut tokens, &normalized[start..i]);
            start = i;
        }
    }
    push_lowercase(&mut tokens, &normalized[start..]);
    tokens
}

fn push_lowercase(tokens: &mut Vec<String>, word: &str) {
    if !word.is_empty() {
        tokens.push(word.to_lowercase());
    }
}

/// Tokens for a service full name: `service`, the split last package
/// component, then the split service name without its `Service` suffix.
pub fn derive_service_tokens(full_name: &str) -> Vec<String> {
    if full_name.is_empty() {
        return Vec::new();
    }

    let descriptor = ServiceDescriptor::new(full_name);
    let name = descriptor.name();
    let name = name.strip_suffix(SERVICE_SUFFIX).unwrap_or(name);

    let mut tokens = vec![SERVICE_TOKEN.to_string()];
    tokens.extend(split_pascal_case(descriptor.package_name()));
    tokens.extend(split_pascal_case(name));
    tokens
}

/// Tokens addressing `method` of `service` under `prefix`. Overrides on the
/// descriptors replace the derived parts verbatim.
///
/// # Errors
/// `InvalidSubject` when the service part is empty or the result contains
/// reserved characters.
pub fn derive_subject(
    prefix: &str,
    service: &ServiceDescriptor,
    method: &MethodDescriptor,
) -> Result<Vec<String>, Error> {
    let service_tokens = match service.subject_prefix() {
        Some(prefix) if !prefix.trim().is_empty() => dot_split(prefix),
        _ => derive_service_tokens(service.full_name()),
    };
    if service_tokens.is_empty() {
        return Err(Error::InvalidSubject(format!(
            "{}@{}",
            method.name(),
            service.full_name()
        )));
    }

    let method_tokens = match method.subject_suffix() {
        Some(suffix) if !suffix.trim().is_empty() => dot_split(suffix),
        _ => split_pascal_case(method.name()),
    };

    let tokens: Vec<String> = dot_split(prefix)
        .into_iter()
        .chain(service_tokens)
        .chain(method_tokens)
        .collect();

    Subject::join(&tokens)
        .validate()
        .map_err(|e| Error::InvalidSubject(e.to_string()))?;

    Ok(tokens)
}

fn dot_split(value: &str) -> Vec<String> {
    value
        .split('.')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Dot-splits every token and substitutes `{name}` variables. Unbound
/// variables become the single-level wildcard.
pub fn split_and_parametrize_tokens(
    tokens: &[String],
    vars: Option<&HashMap<String, String>>,
) -> Vec<String> {
    tokens
        .iter()
        .flat_map(|token| dot_split(token))
        .map(|token| match variable_name(&token) {
            Some(name) => vars
                .and_then(|vars| vars.get(name))
                .cloned()
                .unwrap_or_else(|| WILDCARD_ONE.to_string()),
            None => token,
        })
        .collect()
}

fn variable_name(token: &str) -> Option<&str> {
    if token.starts_with('{') || token.ends_with('}') {
        Some(token.trim_start_matches('{').trim_end_matches('}'))
    } else {
        None
    }
}

/// Variables visible to one service. Keys scoped as `{service}/{var}` win
/// over unscoped keys of the same name; keys scoped to other services are
/// dropped.
pub fn extract_service_vars(
    service_full_name: &str,
    vars: Option<&HashMap<String, String>>,
) -> Option<HashMap<String, String>> {
    let vars = vars?;

    let mut extracted: HashMap<String, String> = vars
        .iter()
        .filter(|(key, _)| !key.contains('/'))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    for (key, value) in vars {
        if let Some((service, name)) = key.split_once('/')
            && service == service_full_name
        {
            extracted.insert(name.to_string(), value.clone());
        }
    }

    Some(extracted)
}

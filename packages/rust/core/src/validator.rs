//! StructuralValidator: deterministic rules over an untrusted candidate.
//!
//! Errors make a candidate unusable. Warnings multiply the confidence
//! multiplier by a fixed penalty each, so independent defects compound.
//! Pure: no I/O, same input gives the same report.

use regex::Regex;
use serde_json::Value;
use url::Url;

use mcpextract_shared::{CandidateConfig, Transport, ValidationReport};

/// Launchers accepted without penalty. Commands starting with `./` are
/// accepted as local binaries.
pub const KNOWN_COMMANDS: &[&str] = &[
    "npx", "npm", "node", "bun", "deno", "docker", "python", "python3", "uv", "uvx", "cargo", "go",
];

/// Fields every candidate must carry.
pub const REQUIRED_FIELDS: [&str; 4] = ["name", "command", "args", "env"];

/// Descriptor fields each env entry should document.
pub const DESCRIPTOR_FIELDS: [&str; 3] = ["required", "description", "example"];

pub const UNKNOWN_COMMAND_PENALTY: f64 = 0.8;
pub const DOCKER_PENALTY: f64 = 0.9;
pub const NPX_PENALTY: f64 = 0.95;
pub const PYTHON_PENALTY: f64 = 0.9;
pub const DESCRIPTOR_PENALTY: f64 = 0.95;
/// Applied to the remaining quality checks (defaults, patterns, URLs, transport).
pub const MINOR_PENALTY: f64 = 0.95;

/// Validate `candidate`.
pub fn validate(candidate: &CandidateConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    if let Some(error) = candidate.error() {
        report.push_error(format!("extraction failed: {error}"));
        report.confidence_multiplier = 0.0;
        return report;
    }

    for field in REQUIRED_FIELDS {
        if !candidate.contains(field) {
            report.push_error(format!("missing required field: {field}"));
        }
    }
    check_types(candidate, &mut report);
    if !report.is_valid() {
        report.confidence_multiplier = 0.0;
        return report;
    }

    // Type checks passed: these accessors are populated.
    let command = candidate.command().unwrap_or_default();
    let args = candidate.args().unwrap_or_default();

    check_command(command, &args, &mut report);
    if let Some(env) = candidate.env() {
        for (name, descriptor) in env {
            check_descriptor(name, descriptor, &mut report);
        }
    }
    check_optional_fields(candidate, &mut report);

    for warning in candidate.warnings() {
        report.note(warning);
    }

    report
}

fn check_types(candidate: &CandidateConfig, report: &mut ValidationReport) {
    if let Some(name) = candidate.get("name") {
        if !name.is_string() {
            report.push_error("name must be a string");
        }
    }

    match candidate.get("command") {
        Some(Value::String(command)) if command.trim().is_empty() => {
            report.push_error("command must not be empty");
        }
        Some(Value::String(_)) | None => {}
        Some(_) => report.push_error("command must be a string"),
    }

    match candidate.get("args") {
        Some(Value::Array(items)) => {
            if !items.iter().all(Value::is_string) {
                report.push_error("args must contain only strings");
            }
        }
        Some(_) => report.push_error("args must be a list"),
        None => {}
    }

    match candidate.get("env") {
        Some(Value::Object(env)) => {
            for (name, descriptor) in env {
                if !descriptor.is_object() {
                    report.push_error(format!("env var {name} must be an object"));
                }
            }
        }
        Some(_) => report.push_error("env must be a mapping"),
        None => {}
    }

    match candidate.get("install") {
        Some(Value::String(_)) | Some(Value::Null) | None => {}
        Some(_) => report.push_error("install must be a string or null"),
    }
}

/// Whether `command` belongs to the Python launcher family
/// (`python`, `python3`, `python3.N`).
fn is_python_launcher(command: &str) -> bool {
    match command.strip_prefix("python3.") {
        Some(minor) => !minor.is_empty() && minor.chars().all(|c| c.is_ascii_digit()),
        None => matches!(command, "python" | "python3"),
    }
}

fn check_command(command: &str, args: &[&str], report: &mut ValidationReport) {
    let known = KNOWN_COMMANDS.contains(&command)
        || command.starts_with("./")
        || is_python_launcher(command);
    if !known {
        report.penalize(format!("unusual command: {command}"), UNKNOWN_COMMAND_PENALTY);
    }

    match command {
        "docker" => {
            if args.first() != Some(&"run") {
                report.penalize("docker command should start with 'run'", DOCKER_PENALTY);
            }
            if !args.iter().any(|a| *a == "-i" || *a == "--interactive") {
                report.penalize("docker missing -i flag for stdio", DOCKER_PENALTY);
            }
        }
        "npx" => {
            if args.first() != Some(&"-y") {
                report.penalize("npx should use the -y flag", NPX_PENALTY);
            }
            if !args.iter().any(|a| !a.starts_with('-')) {
                report.penalize("npx missing package name", MINOR_PENALTY);
            }
        }
        c if is_python_launcher(c) => {
            if args.first() != Some(&"-m") {
                report.penalize("python should use the -m flag", PYTHON_PENALTY);
            }
        }
        _ => {}
    }
}

fn check_descriptor(name: &str, descriptor: &Value, report: &mut ValidationReport) {
    for field in DESCRIPTOR_FIELDS {
        if descriptor.get(field).is_none() {
            report.penalize(
                format!("env var {name} missing field: {field}"),
                DESCRIPTOR_PENALTY,
            );
        }
    }

    let required = descriptor.get("required").and_then(Value::as_bool) == Some(true);
    let has_default = descriptor.get("default").is_some_and(|d| !d.is_null());
    if required && has_default {
        report.penalize(
            format!("env var {name} is required but has a default"),
            MINOR_PENALTY,
        );
    }

    if let Some(pattern) = descriptor.get("validation_pattern").and_then(Value::as_str) {
        if Regex::new(pattern).is_err() {
            report.penalize(
                format!("env var {name} has an invalid validation_pattern"),
                MINOR_PENALTY,
            );
        }
    }

    if let Some(location) = descriptor.get("where_to_get").and_then(Value::as_str) {
        if Url::parse(location).is_err() {
            report.penalize(
                format!("env var {name} where_to_get is not an absolute URL"),
                MINOR_PENALTY,
            );
        }
    }
}

fn check_optional_fields(candidate: &CandidateConfig, report: &mut ValidationReport) {
    match candidate.get("transport") {
        None | Some(Value::Null) => {}
        Some(Value::String(t)) if Transport::parse(t).is_some() => {}
        Some(other) => report.penalize(format!("unknown transport: {other}"), MINOR_PENALTY),
    }

    match candidate.get("confidence") {
        None | Some(Value::Null) => {}
        Some(value) => match value.as_f64() {
            Some(c) if (0.0..=1.0).contains(&c) => {}
            Some(c) => report.penalize(
                format!("self-reported confidence {c} outside [0, 1]"),
                MINOR_PENALTY,
            ),
            None => report.penalize("self-reported confidence is not a number", MINOR_PENALTY),
        },
    }
}

//! Spec path → runner URL resolution.
//!
//! Spec paths arrive with whatever separator convention the host uses;
//! URLs always use forward slashes. Joining segments can introduce
//! doubled slashes, which are collapsed everywhere except the
//! protocol's intentional `//`.

use std::path::Path;

use crate::config::ConfigSnapshot;
use crate::specs::SpecType;

/// Sentinel meaning "run every spec".
pub const ALL_SPECS: &str = "__all";

fn forward_slashes(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Collapse doubled slashes introduced by joining, preserving the `//`
/// that follows a protocol's `:`.
pub fn collapse_double_slashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '/' && out.ends_with('/') {
            let bytes = out.as_bytes();
            let after_protocol = bytes.len() >= 2 && bytes[bytes.len() - 2] == b':';
            if !after_protocol {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Percent-escape characters unsafe in a URL fragment. Slashes stay
/// literal so the path reads naturally in the address bar.
pub fn escape_spec_fragment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '#' => out.push_str("%23"),
            '?' => out.push_str("%3F"),
            '"' => out.push_str("%22"),
            '<' => out.push_str("%3C"),
            '>' => out.push_str("%3E"),
            '`' => out.push_str("%60"),
            '{' => out.push_str("%7B"),
            '}' => out.push_str("%7D"),
            '^' => out.push_str("%5E"),
            '|' => out.push_str("%7C"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("%{:02X}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Path of a spec relative to its type's root folder, prefixed with the
/// type segment. Separator-convention independent.
pub fn get_prefixed_path_to_spec(
    config: &ConfigSnapshot,
    spec_path: &Path,
    spec_type: SpecType,
) -> String {
    let folder = match spec_type {
        SpecType::Integration => &config.integration_folder,
        SpecType::Component => &config.component_folder,
    };
    let folder = forward_slashes(folder);
    let spec = forward_slashes(spec_path);
    let relative = spec
        .strip_prefix(&folder)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or_else(|| spec.trim_start_matches('/'));
    collapse_double_slashes(&format!("/{spec_type}/{relative}"))
}

/// Full runner URL for a spec, or the aggregate-run URL when `spec_path`
/// is absent or the [`ALL_SPECS`] sentinel.
pub fn get_spec_url(
    config: &ConfigSnapshot,
    spec_path: Option<&Path>,
    spec_type: SpecType,
) -> String {
    let browser_url = config.browser_url.as_deref().unwrap_or("");
    let run_all = match spec_path {
        None => true,
        Some(p) => p.as_os_str() == ALL_SPECS,
    };
    if run_all {
        return collapse_double_slashes(&format!("{browser_url}/#/tests/{ALL_SPECS}"));
    }
    let prefixed = get_prefixed_path_to_spec(config, spec_path.expect("checked above"), spec_type);
    let escaped = escape_spec_fragment(&prefixed);
    collapse_double_slashes(&format!("{browser_url}/#/tests/{escaped}"))
}

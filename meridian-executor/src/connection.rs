//! Per-shard connection string templating (§4.5): the caller supplies a
//! template without a database; `Data Source` and `Initial Catalog` are
//! substituted per shard, and a fixed suffix is appended to `Application
//! Name`, truncated to a 128-character cap for audit.

use meridian_core::ShardLocation;

const APPLICATION_NAME_CAP: usize = 128;

/// Builds the per-shard connection string from `template`, an ADO.NET-style
/// `key=value;key=value` string that may already carry an `Application
/// Name` segment.
pub fn build_connection_string(template: &str, location: &ShardLocation, application_suffix: &str) -> String {
    let mut pairs = Vec::new();
    let mut saw_application_name = false;

    for part in template.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let mut kv = part.splitn(2, '=');
        let key = kv.next().unwrap_or("").trim();
        let value = kv.next().unwrap_or("").trim();
        if key.eq_ignore_ascii_case("application name") {
            saw_application_name = true;
            pairs.push(format!("{key}={}", cap_application_name(&format!("{value}{application_suffix}"))));
        } else {
            pairs.push(format!("{key}={value}"));
        }
    }

    pairs.push(format!("Data Source={}", location.server));
    pairs.push(format!("Initial Catalog={}", location.database));
    if !saw_application_name {
        pairs.push(format!("Application Name={}", cap_application_name(application_suffix)));
    }

    pairs.join(";")
}

fn cap_application_name(name: &str) -> String {
    name.chars().take(APPLICATION_NAME_CAP).collect()
}

use rand::RngCore;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The sub directory reserved for operator-placed configuration.
pub const CONFIG_SUBDIR: &str = "config";

/// The sub directory where template documents are stored.
pub const TEMPLATES_SUBDIR: &str = "templates";

/// The sub directory where managed server directories live.
pub const SERVERS_SUBDIR: &str = "servers";

/// The sub directory where backup archives are stored, keyed by server id.
pub const BACKUPS_SUBDIR: &str = "backups";

/// The sub directory where native-backend stdout/stderr captures live.
pub const LOGS_SUBDIR: &str = "logs";

/// The per-server configuration sidecar filename.
pub const SIDECAR_FILENAME: &str = ".garcon.yaml";

/// The persisted native-backend process records file.
pub const NATIVE_RECORDS_FILENAME: &str = "native-processes.json";

/// The persisted server ordering document.
pub const SERVER_ORDER_FILENAME: &str = "server-order.json";

/// The prefix applied to every managed container name.
pub const CONTAINER_NAME_PREFIX: &str = "garcon-";

/// Label marking a container as managed by garcon.
pub const MANAGED_LABEL: &str = "garcon.managed";

/// Label carrying the owning server id on a managed container.
pub const SERVER_ID_LABEL: &str = "garcon.server_id";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reduces a display name to a filesystem- and container-name-safe slug.
///
/// Lowercases, maps runs of non-alphanumeric characters to single dashes and
/// trims leading/trailing dashes. An all-symbol name yields `"server"` so the
/// generated id is never empty.
pub fn slugify(name: &str) -> String {
    let slug = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    if slug.is_empty() {
        "server".to_string()
    } else {
        slug
    }
}

/// Generates a server id from a display name: `slug(name)-<40-bit-hex>`.
pub fn generate_server_id(name: &str) -> String {
    let mut bytes = [0u8; 5];
    rand::thread_rng().fill_bytes(&mut bytes);

    let suffix = bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();

    format!("{}-{}", slugify(name), suffix)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Alpha"), "alpha");
        assert_eq!(slugify("My Cool Server!"), "my-cool-server");
        assert_eq!(slugify("  spaced   out  "), "spaced-out");
        assert_eq!(slugify("Überserver 2"), "berserver-2");
        assert_eq!(slugify("***"), "server");
    }

    #[test]
    fn test_generate_server_id_shape() {
        let id = generate_server_id("Alpha");
        let (slug, suffix) = id.rsplit_once('-').unwrap();
        assert_eq!(slug, "alpha");
        assert_eq!(suffix.len(), 10);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

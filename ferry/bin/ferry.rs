#[cfg(not(unix))]
compile_error!("Only unix is currently supported");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = find_config_file()?;
    let config_content = std::fs::read_to_string(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to read config from {}: {}",
            config_path.display(),
            e
        )
    })?;
    let ferry: ferry::Ferry = ron::from_str(&config_content)?;

    ferry.run().await
}

/// Find the configuration file using the following precedence:
/// 1. `FERRY_CONFIG` environment variable
/// 2. ./ferry.config.ron (current working directory)
/// 3. /etc/ferry/ferry.config.ron (system-wide config)
fn find_config_file() -> anyhow::Result<std::path::PathBuf> {
    if let Ok(env_path) = std::env::var("FERRY_CONFIG") {
        let path = std::path::PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "FERRY_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        std::path::PathBuf::from("./ferry.config.ron"),
        std::path::PathBuf::from("/etc/ferry/ferry.config.ron"),
    ];

    if let Some(path) = default_paths.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - FERRY_CONFIG environment variable\n{paths_tried}"
    )
}

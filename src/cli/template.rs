use anyhow::{Context, Result};

/// 配置模板内容
pub const RELAY_TEMPLATE: &str = include_str!("../../templates/relay-template.toml");

/// Generate configuration template
pub fn generate_config_template(output: Option<&str>) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, RELAY_TEMPLATE)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!("Generated relay configuration template: {}", path);
    } else {
        println!("{}", RELAY_TEMPLATE);
    }

    Ok(())
}

use anyhow::Result;
use console::style;
use parley::backends::factory::BackendRegistry;
use parley::config::Settings;

pub fn execute() -> Result<()> {
    let settings = Settings::new()?;
    let registry = BackendRegistry::from_settings(&settings)?;

    for model in registry.models() {
        let marker = if model.id == registry.default_model() {
            style("*").green().bold().to_string()
        } else {
            " ".to_string()
        };
        println!(
            "{} {} {} {}",
            marker,
            style(&model.id).bold(),
            model.name,
            style(format!("({})", model.description)).dim()
        );
    }
    Ok(())
}

use tracing_subscriber::{filter::Directive, EnvFilter};

const DEFAULT_DIRECTIVES: &[&str] = &["water_service=info", "water_client=info"];

pub fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    for directive in DEFAULT_DIRECTIVES {
        if let Ok(d) = directive.parse::<Directive>() {
            filter = filter.add_directive(d);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

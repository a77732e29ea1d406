use devlink_bridge::config::Config;
use devlink_bridge::error::Result;
use devlink_bridge::supervisor::Supervisor;

fn main() -> Result<()> {
    let config = Config::from_env()?;
    Supervisor::new(config).run()
}

//! `check`: report whether the Docker daemon can be used.

use crate::config::Config;
use crate::docker::{DockerClient, check_docker};

pub async fn run_check_command(config: &Config) -> anyhow::Result<()> {
    let client = DockerClient::new(config.docker.clone());
    let detection = check_docker(&client, &config.docker.socket_path).await;

    println!("Socket:   {}", config.docker.socket_path.display());
    println!("Platform: {:?}", detection.platform);
    println!("Status:   {}", detection.status.as_str());
    if let Some(version) = &detection.version {
        println!(
            "Version:  {} (API {}, {}/{})",
            version.version, version.api_version, version.os, version.arch
        );
    }

    if let Some(hint) = detection.hint() {
        println!();
        println!("{}", hint);
        anyhow::bail!("Docker is {}", detection.status.as_str());
    }
    Ok(())
}

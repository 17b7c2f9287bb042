//! Open a local forward and a SOCKS proxy over one session, then wait for Ctrl-C.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example tunnels -- --host bastion --user admin \
//!     --local 8080:intranet.example:80 --socks 1080
//! ```
//!
//! Authenticates with the running ssh-agent unless `--password` or `--key` is given.
//!
//! Then `curl http://localhost:8080/` or `curl --socks5-hostname localhost:1080 http://intranet.example/`.

use std::env;
use std::path::PathBuf;

use ferrexpect::SessionBuilder;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let value = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };

    let host = value("--host").unwrap_or_else(|| "localhost".to_string());
    let user = value("--user").unwrap_or_else(|| env::var("USER").unwrap_or_else(|_| "root".to_string()));

    let mut builder = SessionBuilder::new(&host).username(&user);
    if let Some(password) = value("--password") {
        builder = builder.password(password);
    } else if let Some(key) = value("--key") {
        builder = builder.private_key(PathBuf::from(key));
    } else {
        builder = builder.agent();
    }

    let mut session = builder.build()?;
    session.login().await?;

    if let Some(spec) = value("--local") {
        let parts: Vec<&str> = spec.splitn(3, ':').collect();
        let [local_port, remote_host, remote_port] = parts[..] else {
            eprintln!("Error: --local expects LOCAL_PORT:HOST:PORT");
            std::process::exit(1);
        };
        let handle = session
            .forward_local(local_port.parse()?, remote_host, remote_port.parse()?, None)
            .await?;
        println!("local forward {} on {:?}", handle.key(), handle.local_addr());
    }

    if let Some(port) = value("--socks") {
        let handle = session.forward_dynamic(port.parse()?).await?;
        println!("SOCKS proxy on {:?}", handle.local_addr());
    }

    println!("{} tunnel(s) running, press Ctrl-C to stop", session.tunnels().len());
    tokio::signal::ctrl_c().await?;

    let report = session.close_tunnels().await;
    for (key, error) in &report.failures {
        eprintln!("tunnel {} did not close cleanly: {}", key, error);
    }
    session.exit().await?;
    Ok(())
}

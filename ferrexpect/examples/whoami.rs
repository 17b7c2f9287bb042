//! Log in, run a few commands, then optionally escalate with sudo.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example whoami -- --host localhost --user your_username --password your_password
//! ```
//!
//! Escalate before the second `whoami`:
//! ```bash
//! cargo run --example whoami -- --host localhost --user admin --key ~/.ssh/id_ed25519 --sudo-password secret
//! ```

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use ferrexpect::{CommandOptions, SessionBuilder};
use secrecy::SecretString;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (set RUST_LOG=debug for verbose output)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    println!("Connecting to {}:{}...", args.host, args.port);

    let mut builder = SessionBuilder::new(&args.host)
        .port(args.port)
        .username(&args.user)
        .timeout(Duration::from_secs(args.timeout));

    if let Some(password) = &args.password {
        builder = builder.password(password);
    } else if let Some(key_path) = &args.key {
        builder = builder.private_key(key_path);
    } else {
        eprintln!("Error: Must provide either --password or --key");
        std::process::exit(1);
    }

    let mut session = builder.build()?;
    session.login().await?;
    println!("Logged in, prompt pattern: {}", session.prompt_pattern());

    let trimmed = CommandOptions::new().remove_trailing_newline(true);
    for cmd in ["whoami", "pwd", "uname -a"] {
        let out = session.command_with(cmd, &trimmed).await?;
        println!("{cmd}: {out}");
    }

    if let Some(sudo_password) = args.sudo_password {
        println!("\nEscalating with sudo...");
        match session
            .sudo(&SecretString::from(sudo_password), true, "su -")
            .await
        {
            Ok(()) => {
                let out = session.command_with("whoami", &trimmed).await?;
                println!("whoami: {out}");
                session.unescalate().await?;
                let out = session.command_with("whoami", &trimmed).await?;
                println!("back to: {out}");
            }
            Err(e) if e.is_bad_sudo_password() => eprintln!("sudo refused the password"),
            Err(e) => return Err(e.into()),
        }
    }

    session.exit().await?;
    println!("Done!");
    Ok(())
}

struct Args {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    key: Option<PathBuf>,
    sudo_password: Option<String>,
    timeout: u64,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut parsed = Self {
            host: "localhost".to_string(),
            port: 22,
            user: env::var("USER").unwrap_or_else(|_| "root".to_string()),
            password: None,
            key: None,
            sudo_password: None,
            timeout: 30,
        };

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1).cloned();
            match args[i].as_str() {
                "--host" | "-h" => parsed.host = value.unwrap_or(parsed.host),
                "--port" | "-p" => parsed.port = value.and_then(|v| v.parse().ok()).unwrap_or(22),
                "--user" | "-u" => parsed.user = value.unwrap_or(parsed.user),
                "--password" | "-P" => parsed.password = value,
                "--key" | "-k" => parsed.key = value.map(PathBuf::from),
                "--sudo-password" => parsed.sudo_password = value,
                "--timeout" | "-t" => parsed.timeout = value.and_then(|v| v.parse().ok()).unwrap_or(30),
                "--help" => {
                    println!(
                        "usage: whoami [--host HOST] [--port PORT] [--user USER] \
                         (--password PASS | --key PATH) [--sudo-password PASS] [--timeout SECS]"
                    );
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {}", other);
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }
        parsed
    }
}

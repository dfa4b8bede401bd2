use clap::{Parser, Subcommand};
use common::{Ack, EndPortRequest, Failure, GeosReply, PortEndpoint, PortGranted, PortReply, PortRequest};
use reqwest::Client;
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::time;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Request a proxy port once
    Request {
        servername: String,
        #[arg(long)]
        geo: String,
        #[arg(long, default_value_t = 5)]
        priority: u8,
        /// 4, 6, or 0 for either
        #[arg(long, default_value_t = 0)]
        ip_version: u8,
        /// Rent duration in seconds
        #[arg(long, default_value_t = 600)]
        rent_time: u32,
    },
    /// Request a proxy port and poll until one is granted
    Watch {
        servername: String,
        #[arg(long)]
        geo: String,
        #[arg(long, default_value_t = 5)]
        priority: u8,
        #[arg(long, default_value_t = 0)]
        ip_version: u8,
        #[arg(long, default_value_t = 600)]
        rent_time: u32,
        /// Seconds between polls
        #[arg(long, default_value_t = 5)]
        every: u64,
    },
    /// End an order and give the port back
    End {
        lease_id: i64,
    },
    /// List geos that currently have ports
    Geos,
    /// Rent a port, run a command with the proxy URL in its environment,
    /// then end the order
    Run {
        servername: String,
        #[arg(long)]
        geo: String,
        #[arg(long, default_value_t = 5)]
        priority: u8,
        #[arg(long, default_value_t = 0)]
        ip_version: u8,
        #[arg(long, default_value_t = 600)]
        rent_time: u32,

        /// Environment variable name for the proxy URL (default: PROXY_URL)
        #[arg(long, default_value = "PROXY_URL")]
        env_name: String,

        /// Command and arguments to execute
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

const DEFAULT_BASE_URL: &str = "http://localhost:3030";

fn base_url() -> String {
    std::env::var("PROXYRENT_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

fn with_auth(req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    let mut req = req;
    if let Ok(login) = std::env::var("PROXYRENT_LOGIN") {
        req = req.header("x-api-login", login);
    }
    if let Ok(key) = std::env::var("PROXYRENT_API_KEY") {
        req = req.header("x-api-key", key);
    }
    req
}

fn port_request(
    servername: String,
    geo: String,
    priority: u8,
    ip_version: u8,
    rent_time: u32,
) -> PortRequest {
    PortRequest {
        servername,
        priority,
        geo,
        ip_version,
        rent_time_seconds: rent_time,
    }
}

async fn request_port(
    client: &Client,
    base: &str,
    req: &PortRequest,
) -> Result<PortReply, reqwest::Error> {
    let resp = with_auth(client.get(format!("{}/getport", base)))
        .query(req)
        .send()
        .await?;
    resp.json::<PortReply>().await
}

fn print_grant(grant: &PortGranted) {
    println!("Granted lease {} until {}", grant.lease_id, grant.expires_at);
    println!("  host:  {}", grant.port_endpoint.host);
    if let Some(port) = grant.port_endpoint.http_port {
        println!("  http:  {}", port);
    }
    if let Some(port) = grant.port_endpoint.socks_port {
        println!("  socks: {}", port);
    }
    if let Some(login) = &grant.port_endpoint.login {
        println!("  login: {}", login);
    }
    if let Some(password) = &grant.port_endpoint.password {
        println!("  pass:  {}", password);
    }
}

/// Proxy URL for a child process, http endpoint first when offered.
fn proxy_env_url(endpoint: &PortEndpoint) -> Option<String> {
    let auth = match (&endpoint.login, &endpoint.password) {
        (Some(login), Some(password)) => format!("{}:{}@", login, password),
        (Some(login), None) => format!("{}@", login),
        _ => String::new(),
    };
    if let Some(port) = endpoint.http_port {
        return Some(format!("http://{}{}:{}", auth, endpoint.host, port));
    }
    endpoint
        .socks_port
        .map(|port| format!("socks5://{}{}:{}", auth, endpoint.host, port))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();
    let base = base_url();

    match cli.command {
        Commands::Request {
            servername,
            geo,
            priority,
            ip_version,
            rent_time,
        } => {
            let req = port_request(servername, geo, priority, ip_version, rent_time);
            match request_port(&client, &base, &req).await? {
                PortReply::Granted(grant) => print_grant(&grant),
                PortReply::Refused(failure) => {
                    eprintln!("Refused: {}", failure.reason);
                    std::process::exit(1);
                }
            }
        }
        Commands::Watch {
            servername,
            geo,
            priority,
            ip_version,
            rent_time,
            every,
        } => {
            let req = port_request(servername, geo, priority, ip_version, rent_time);
            let mut interval = time::interval(Duration::from_secs(every.max(1)));
            loop {
                interval.tick().await;
                match request_port(&client, &base, &req).await {
                    Ok(PortReply::Granted(grant)) => {
                        print_grant(&grant);
                        break;
                    }
                    Ok(PortReply::Refused(failure)) => {
                        println!("Waiting: {}", failure.reason);
                    }
                    Err(e) => {
                        eprintln!("Request error: {}", e);
                        break;
                    }
                }
            }
        }
        Commands::End { lease_id } => {
            let resp = with_auth(client.get(format!("{}/endport", base)))
                .query(&EndPortRequest { lease_id })
                .send()
                .await?;
            if resp.status().is_success() {
                let ack: Ack = resp.json().await?;
                println!(
                    "{}",
                    ack.message.unwrap_or_else(|| "order ended".to_string())
                );
            } else {
                let failure: Failure = resp.json().await?;
                eprintln!("Failed to end order: {}", failure.reason);
                std::process::exit(1);
            }
        }
        Commands::Geos => {
            let resp = with_auth(client.get(format!("{}/geos", base))).send().await?;
            if resp.status().is_success() {
                let reply: GeosReply = resp.json().await?;
                for geo in reply.geos {
                    println!("{}", geo);
                }
            } else {
                let failure: Failure = resp.json().await?;
                eprintln!("Failed to list geos: {}", failure.reason);
                std::process::exit(1);
            }
        }
        Commands::Run {
            servername,
            geo,
            priority,
            ip_version,
            rent_time,
            env_name,
            command,
        } => {
            if command.is_empty() {
                eprintln!("No command specified");
                std::process::exit(1);
            }

            let req = port_request(servername.clone(), geo, priority, ip_version, rent_time);
            let grant = match request_port(&client, &base, &req).await? {
                PortReply::Granted(grant) => grant,
                PortReply::Refused(failure) => {
                    eprintln!("Failed to rent a port: {}", failure.reason);
                    std::process::exit(1);
                }
            };
            let Some(proxy_url) = proxy_env_url(&grant.port_endpoint) else {
                eprintln!("Granted port offers no usable protocol");
                std::process::exit(1);
            };
            println!(
                "Rented lease {} for service '{}'",
                grant.lease_id, servername
            );

            let cmd = &command[0];
            let args = &command[1..];
            println!("Running: {} {:?} with {}={}", cmd, args, env_name, proxy_url);

            let status = Command::new(cmd)
                .args(args)
                .env(&env_name, &proxy_url)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status();

            // Give the port back whatever the command did.
            let _ = with_auth(client.get(format!("{}/endport", base)))
                .query(&EndPortRequest {
                    lease_id: grant.lease_id,
                })
                .send()
                .await;
            println!("Ended order {}", grant.lease_id);

            match status {
                Ok(s) => {
                    if !s.success() {
                        std::process::exit(s.code().unwrap_or(1));
                    }
                }
                Err(e) => {
                    eprintln!("Failed to run command: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

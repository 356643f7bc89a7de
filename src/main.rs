use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use floodgate::clock::SystemClock;
use floodgate::config::FloodgateConfig;
use floodgate::ratelimit::{Admission, CallerContext, Identity, PolicyRegistry, RateLimiter};

/// Command line tool for inspecting and operating Floodgate throttling state.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective policy table
    Presets,

    /// Run throttling checks for one caller and print each decision
    Check {
        /// Policy name
        #[arg(short, long, default_value = "api")]
        policy: String,

        /// Authenticated user id
        #[arg(short, long)]
        user: Option<String>,

        /// Caller address, sent as X-Forwarded-For
        #[arg(long)]
        ip: Option<String>,

        /// Role of the authenticated user
        #[arg(long, requires = "user")]
        role: Option<String>,

        /// Number of requests to simulate
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },

    /// Show the stored state for a resolved key such as `user:42`
    Inspect {
        key: String,

        /// Policy used to compute the current decision
        #[arg(short, long, default_value = "api")]
        policy: String,
    },

    /// Forget all throttling state for a resolved key
    Reset { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = FloodgateConfig::load(cli.config.as_deref())?;
    let registry = config.registry()?;

    match cli.command {
        Command::Presets => print_presets(&registry),
        Command::Check {
            policy,
            user,
            ip,
            role,
            count,
        } => {
            let limiter = build_limiter(&config).await?;
            let policy = registry.get(&policy);
            let ctx = caller(user, ip, role);
            for attempt in 1..=count {
                let admission = limiter.check(policy, &ctx).await;
                print_admission(attempt, &admission)?;
            }
        }
        Command::Inspect { key, policy } => {
            let limiter = build_limiter(&config).await?;
            let (state, tier) = limiter.admin().inspect(&key).await;
            match state {
                Some(state) => println!("{} ({:?}): {}", key, tier, state.to_json()?),
                None => println!("{} ({:?}): no live state", key, tier),
            }
            let decision = limiter.peek(registry.get(&policy), &key).await;
            println!(
                "next request: allowed={} remaining={} reset_at={}",
                decision.allowed, decision.remaining, decision.reset_at
            );
        }
        Command::Reset { key } => {
            let limiter = build_limiter(&config).await?;
            if limiter.admin().reset(&key).await {
                println!("{} reset", key);
            } else {
                anyhow::bail!("{} reset locally, remote store did not confirm", key);
            }
        }
    }

    Ok(())
}

async fn build_limiter(config: &FloodgateConfig) -> anyhow::Result<RateLimiter> {
    let clock = Arc::new(SystemClock::new());
    let store = config.store.build(clock.clone()).await?;
    info!(remote = store.has_remote(), "State store ready");
    Ok(RateLimiter::with_clock(store, clock))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn caller(user: Option<String>, ip: Option<String>, role: Option<String>) -> CallerContext {
    let mut ctx = CallerContext::new("/");
    if let Some(user) = user {
        let identity = match role {
            Some(role) => Identity::new(user).with_role(role),
            None => Identity::new(user),
        };
        ctx = ctx.with_identity(identity);
    }
    if let Some(ip) = ip {
        ctx = ctx.with_header("x-forwarded-for", ip);
    }
    ctx
}

fn print_presets(registry: &PolicyRegistry) {
    println!(
        "{:<16} {:>10} {:>8} {:<15} {:<8} {}",
        "NAME", "WINDOW_MS", "MAX", "ALGORITHM", "KEY", "FLAGS"
    );
    for (name, policy) in registry.iter() {
        let mut flags = Vec::new();
        if policy.skip.is_some() {
            flags.push("skip");
        }
        if policy.skip_successful {
            flags.push("skip_successful");
        }
        if policy.skip_failed {
            flags.push("skip_failed");
        }
        if !policy.emit_headers {
            flags.push("no_headers");
        }
        println!(
            "{:<16} {:>10} {:>8} {:<15} {:<8} {}",
            name,
            policy.window_ms,
            policy.max_requests,
            policy.algorithm.as_str(),
            policy.key_resolver.name(),
            flags.join(",")
        );
    }
}

fn print_admission(attempt: u32, admission: &Admission) -> anyhow::Result<()> {
    match admission {
        Admission::Bypassed => println!("#{} bypassed", attempt),
        Admission::FailedOpen => println!("#{} allowed (engine failed open)", attempt),
        Admission::Allowed {
            key,
            headers,
            tier,
            ..
        } => {
            let pairs = headers
                .to_pairs(true)
                .into_iter()
                .map(|(name, value)| format!("{}: {}", name, value))
                .collect::<Vec<_>>()
                .join(", ");
            println!("#{} allowed {} via {:?} [{}]", attempt, key, tier, pairs);
        }
        Admission::Denied {
            key,
            response,
            tier,
            ..
        } => {
            println!(
                "#{} denied {} via {:?} status={} retry_after={:?}",
                attempt,
                key,
                tier,
                response.status,
                response.retry_after()
            );
            println!("{}", response.body_json()?);
        }
    }
    Ok(())
}

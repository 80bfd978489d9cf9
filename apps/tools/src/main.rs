use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use server_api::auth::{hash_password, issue_token, AuthConfig};
use shared::domain::UserId;
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/chat.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
        email: String,
        password: String,
        #[arg(long, default_value_t = 10)]
        bcrypt_cost: u32,
    },
    MintToken {
        user_id: i64,
        #[arg(long, env = "JWT_SECRET")]
        jwt_secret: String,
        #[arg(long, default_value_t = 7 * 24 * 60 * 60)]
        ttl_seconds: i64,
    },
    ListUsers,
    ResetPresence,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser {
            username,
            email,
            password,
            bcrypt_cost,
        } => {
            let hash = hash_password(&password, bcrypt_cost)?;
            let user_id = storage
                .create_user(username.trim(), &email.trim().to_lowercase(), &hash)
                .await?;
            println!("created user_id={user_id}");
        }
        Command::MintToken {
            user_id,
            jwt_secret,
            ttl_seconds,
        } => {
            let user = storage
                .user_by_id(UserId(user_id))
                .await?
                .ok_or_else(|| anyhow!("no user with id {user_id}"))?;
            let token = issue_token(
                &AuthConfig {
                    jwt_secret,
                    token_ttl_seconds: ttl_seconds,
                    bcrypt_cost: 10,
                },
                user.id,
                &user.username,
            )?;
            println!("{token}");
        }
        Command::ListUsers => {
            for user in storage.list_users().await? {
                let state = if user.is_online { "online" } else { "offline" };
                println!("{:>5}  {:<20} {:<30} {state}", user.id, user.username, user.email);
            }
        }
        Command::ResetPresence => {
            let cleared = storage.reset_presence().await?;
            println!("cleared online flag for {cleared} users");
        }
    }

    Ok(())
}

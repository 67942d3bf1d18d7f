//! CipherChat CLI - Command line interface for the encrypted chat services.
//!
//! This tool drives the full end-to-end flow against a local store:
//! registering users, creating rooms, distributing room keys, and
//! sending and reading encrypted messages.

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use cipherchat_accounts::{AccountService, AuthenticatedUser};
use cipherchat_chat::{CreateRoomOpts, MessageService, OutgoingMessage, RoomService};
use cipherchat_common::{RoomId, UserId};
use cipherchat_crypto::keys::SALT_LENGTH;
use cipherchat_crypto::{
    envelope, verification_hash, Envelope, IdentityPublicKey, KdfParams, Salt,
};
use cipherchat_keyring::{key_fingerprint, KeyManager, PublicKeyBundle};
use cipherchat_store::{ChatStore, RoomRole, RoomType, SqliteStore};

#[derive(Parser)]
#[command(name = "cipherchat")]
#[command(about = "CipherChat - End-to-end encrypted chat")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Data directory (defaults to the platform data dir).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new user and generate their identity keys.
    Register {
        /// Username to register.
        #[arg(short, long)]
        username: String,
    },

    /// Create a new room.
    CreateRoom {
        /// Acting user.
        #[arg(short, long)]
        user: String,

        /// Room name.
        #[arg(short, long)]
        name: String,

        /// Room type: "public", "private", or "direct".
        #[arg(short = 't', long, default_value = "private")]
        room_type: String,

        /// Room description.
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Add a member to a room, wrapping the room key for them.
    AddMember {
        /// Acting user (must be admin or moderator).
        #[arg(short, long)]
        user: String,

        /// Room name or id.
        #[arg(short, long)]
        room: String,

        /// Username to add.
        #[arg(short, long)]
        member: String,

        /// Role: "member", "moderator", or "admin".
        #[arg(long, default_value = "member")]
        role: String,
    },

    /// List the rooms a user belongs to.
    Rooms {
        /// Acting user.
        #[arg(short, long)]
        user: String,
    },

    /// List the members of a room.
    Members {
        /// Acting user (must be a member).
        #[arg(short, long)]
        user: String,

        /// Room name or id.
        #[arg(short, long)]
        room: String,
    },

    /// Encrypt and send a message to a room.
    Send {
        /// Acting user.
        #[arg(short, long)]
        user: String,

        /// Room name or id.
        #[arg(short, long)]
        room: String,

        /// Message text.
        #[arg(short, long)]
        message: String,
    },

    /// Fetch and decrypt recent room history.
    History {
        /// Acting user.
        #[arg(short, long)]
        user: String,

        /// Room name or id.
        #[arg(short, long)]
        room: String,

        /// Maximum messages to show.
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Rotate a room's key (admin only).
    RotateKey {
        /// Acting user.
        #[arg(short, long)]
        user: String,

        /// Room name or id.
        #[arg(short, long)]
        room: String,
    },

    /// Show a user's key fingerprint for verification.
    Fingerprint {
        /// Acting user.
        #[arg(short, long)]
        user: String,

        /// Show another user's fingerprint instead.
        #[arg(long)]
        of_user: Option<String>,
    },

    /// Export a shareable public key bundle.
    ExportBundle {
        /// User whose key to export.
        #[arg(short, long)]
        user: String,
    },

    /// Change a user's password, re-wrapping their identity key.
    ChangePassword {
        /// Acting user.
        #[arg(short, long)]
        user: String,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("cipherchat"))
        .unwrap_or_else(|| PathBuf::from(".cipherchat"))
}

/// Open the server keyring, persisting its salt beside the database.
fn open_keyring(data_dir: &Path) -> Result<KeyManager> {
    let master = match std::env::var("CIPHERCHAT_MASTER") {
        Ok(value) => value,
        Err(_) => rpassword::prompt_password("Keyring master password: ")?,
    };

    let salt_path = data_dir.join("keyring.salt");
    let salt = if salt_path.exists() {
        let bytes = std::fs::read(&salt_path)?;
        let bytes: [u8; SALT_LENGTH] = bytes
            .as_slice()
            .try_into()
            .context("Corrupt keyring salt file")?;
        Salt::from_bytes(bytes)
    } else {
        let salt = Salt::generate();
        std::fs::write(&salt_path, salt.as_bytes())?;
        salt
    };

    Ok(KeyManager::with_salt(
        master.as_bytes(),
        salt,
        &KdfParams::interactive(),
    )?)
}

async fn login(accounts: &AccountService, username: &str) -> Result<AuthenticatedUser> {
    let password = rpassword::prompt_password(format!("Password for {}: ", username))?;
    Ok(accounts.login(username, &password).await?)
}

/// Resolve a room argument as an id or a room name visible to the user.
async fn resolve_room(rooms: &RoomService, user: UserId, arg: &str) -> Result<RoomId> {
    if let Ok(id) = RoomId::parse(arg) {
        return Ok(id);
    }
    for room in rooms.list_rooms(user).await? {
        if room.name == arg {
            return Ok(room.id);
        }
    }
    bail!("No room named '{}' (try `cipherchat rooms`)", arg);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

    let store: Arc<dyn ChatStore> =
        Arc::new(SqliteStore::open(data_dir.join("cipherchat.db"))?);
    let accounts = AccountService::new(store.clone(), KdfParams::interactive());

    match cli.command {
        Commands::Register { username } => {
            let password = rpassword::prompt_password("Password: ")?;
            let confirm = rpassword::prompt_password("Confirm password: ")?;
            if password != confirm {
                bail!("Passwords do not match");
            }

            let user = accounts.register(&username, &password).await?;
            let public = IdentityPublicKey::from_base64(&user.public_key)?;

            println!("Registered {} ({})", user.username, user.id);
            println!("Key fingerprint: {}", key_fingerprint(&public));
        }

        Commands::CreateRoom {
            user,
            name,
            room_type,
            description,
        } => {
            let auth = login(&accounts, &user).await?;
            let keyring = Arc::new(open_keyring(&data_dir)?);
            let rooms = RoomService::new(store.clone(), keyring);

            let opts = CreateRoomOpts {
                description,
                ..CreateRoomOpts::default()
            };
            let room = rooms
                .create_room(&auth, &name, RoomType::parse(&room_type)?, opts)
                .await?;

            println!("Created room '{}' ({})", room.name, room.id);
            println!("Key id: {} (version {})", room.key_id, room.key_version);
        }

        Commands::AddMember {
            user,
            room,
            member,
            role,
        } => {
            let auth = login(&accounts, &user).await?;
            let keyring = Arc::new(open_keyring(&data_dir)?);
            let rooms = RoomService::new(store.clone(), keyring);

            let room_id = resolve_room(&rooms, auth.id(), &room).await?;
            let target = store.user_by_username(&member).await?;
            rooms
                .add_member(&auth, room_id, target.id, RoomRole::parse(&role)?)
                .await?;

            println!("Added {} to the room as {}", member, role);
        }

        Commands::Rooms { user } => {
            let auth = login(&accounts, &user).await?;
            let keyring = Arc::new(open_keyring(&data_dir)?);
            let rooms = RoomService::new(store.clone(), keyring);

            let list = rooms.list_rooms(auth.id()).await?;
            if list.is_empty() {
                println!("No rooms");
            }
            for room in list {
                println!(
                    "{}  {}  [{}]  key v{}",
                    room.id,
                    room.name,
                    room.room_type.as_str(),
                    room.key_version
                );
            }
        }

        Commands::Members { user, room } => {
            let auth = login(&accounts, &user).await?;
            let keyring = Arc::new(open_keyring(&data_dir)?);
            let rooms = RoomService::new(store.clone(), keyring);

            let room_id = resolve_room(&rooms, auth.id(), &room).await?;
            for membership in rooms.members(&auth, room_id).await? {
                let record = store.user(membership.user_id).await?;
                println!(
                    "{}  {}  joined {}",
                    record.username,
                    membership.role.as_str(),
                    membership.joined_at.format("%Y-%m-%d %H:%M")
                );
            }
        }

        Commands::Send { user, room, message } => {
            let auth = login(&accounts, &user).await?;
            let keyring = Arc::new(open_keyring(&data_dir)?);
            let rooms = RoomService::new(store.clone(), keyring);
            let messages = MessageService::new(store.clone());

            let room_id = resolve_room(&rooms, auth.id(), &room).await?;
            let room_key = rooms.room_key(&auth, room_id).await?;

            let sealed =
                envelope::seal_room(message.as_bytes(), &room_key, auth.public_key())?;
            let (record, _) = messages
                .post(
                    auth.id(),
                    auth.username(),
                    room_id,
                    OutgoingMessage {
                        encrypted_content: sealed.to_storage_string(),
                        sender_public_key: auth.public_key().to_base64(),
                        content_hash: verification_hash(message.as_bytes()),
                        message_type: "text".to_string(),
                    },
                )
                .await?;

            println!("Sent {}", record.id);
        }

        Commands::History { user, room, limit } => {
            let auth = login(&accounts, &user).await?;
            let keyring = Arc::new(open_keyring(&data_dir)?);
            let rooms = RoomService::new(store.clone(), keyring);
            let messages = MessageService::new(store.clone());

            let room_id = resolve_room(&rooms, auth.id(), &room).await?;
            let room_key = rooms.room_key(&auth, room_id).await?;

            for record in messages.history(auth.id(), room_id, limit).await? {
                let sender = match record.sender_id {
                    Some(id) => store
                        .user(id)
                        .await
                        .map(|u| u.username)
                        .unwrap_or_else(|_| "deleted user".to_string()),
                    None => "deleted user".to_string(),
                };

                let sealed = Envelope::from_storage_string(&record.encrypted_content)?;
                let text = match envelope::open_room(&sealed, &room_key) {
                    Ok(plaintext) => {
                        let verified =
                            verification_hash(&plaintext) == record.content_hash;
                        let text = String::from_utf8_lossy(&plaintext).to_string();
                        if verified {
                            text
                        } else {
                            format!("{} (hash mismatch!)", text)
                        }
                    }
                    Err(_) => "<undecryptable with current room key>".to_string(),
                };

                let edited = if record.is_edited { " (edited)" } else { "" };
                println!(
                    "[{}] {}: {}{}",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    sender,
                    text,
                    edited
                );
            }
        }

        Commands::RotateKey { user, room } => {
            let auth = login(&accounts, &user).await?;
            let keyring = Arc::new(open_keyring(&data_dir)?);
            let rooms = RoomService::new(store.clone(), keyring);

            let room_id = resolve_room(&rooms, auth.id(), &room).await?;
            let room = rooms.rotate_room_key(&auth, room_id).await?;

            println!(
                "Rotated room key: {} (version {})",
                room.key_id, room.key_version
            );
            println!("Note: existing history stays on the previous key until re-encrypted.");
        }

        Commands::Fingerprint { user, of_user } => {
            let target = of_user.unwrap_or(user);
            let record = store.user_by_username(&target).await?;
            let public = IdentityPublicKey::from_base64(&record.public_key)?;

            println!("{}: {}", record.username, key_fingerprint(&public));
        }

        Commands::ExportBundle { user } => {
            let record = store.user_by_username(&user).await?;
            let bundle = PublicKeyBundle::new(record.public_key);

            println!("{}", bundle.export()?);
        }

        Commands::ChangePassword { user } => {
            let old = rpassword::prompt_password("Current password: ")?;
            let new = rpassword::prompt_password("New password: ")?;
            let confirm = rpassword::prompt_password("Confirm new password: ")?;
            if new != confirm {
                bail!("Passwords do not match");
            }

            accounts.change_password(&user, &old, &new).await?;
            println!("Password changed; identity key re-wrapped.");
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "cipherchat", &mut std::io::stdout());
        }
    }

    Ok(())
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{actions, config::Config};

/// The command line interface for labport.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Port to serve on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example JSON handshake carrying a bearer token.
    TokenHandshake,

    /// Show an example JSON handshake carrying the legacy credential pair.
    CredentialsHandshake,

    /// Show an example JSON `serial_output` message.
    SerialOutput,

    /// Show an example JSON `connection_established` message.
    ConnectionEstablished,

    /// Show an example JSON `error` message.
    Error,
}

/// Print whatever the subcommand asked for.
pub fn handle_command(command: Commands) {
    let Commands::Examples(example) = command;

    match example {
        Examples::Config => println!("{}", Config::example().serialize_pretty()),
        Examples::TokenHandshake => {
            println!("{}", actions::Handshake::example_token().serialize())
        }
        Examples::CredentialsHandshake => {
            println!("{}", actions::Handshake::example_credentials().serialize())
        }
        Examples::SerialOutput => {
            println!("{}", actions::ServerMessage::example_serial_output().serialize())
        }
        Examples::ConnectionEstablished => println!(
            "{}",
            actions::ServerMessage::example_connection_established().serialize()
        ),
        Examples::Error => println!("{}", actions::ServerMessage::example_error().serialize()),
    }
}

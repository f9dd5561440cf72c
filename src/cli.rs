use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tubegrab")]
#[command(author, version, about = "Telegram bot that fetches media links through yt-dlp", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the bot in long-polling mode
    Run,

    /// Download one URL from the command line, without the bot
    Download {
        /// Link to fetch
        url: String,

        /// Extract audio instead of keeping the video
        #[arg(long)]
        audio: bool,

        /// Directory the finished file is moved to (defaults to ".")
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Update the yt-dlp binary and exit
    UpdateYtdlp,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "opdispatch",
    about = "opdispatch: inspect operator registrations, key precedence, and resolution plans",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the dispatch key priority table, highest first
    Keys {
        /// Path to a dispatcher config TOML (defaults to the built-in table)
        #[arg(long)]
        config: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Parse an operator schema and print its normalized form
    Schema {
        /// Schema text, e.g. `foo::sum(Tensor[] xs) -> Tensor`
        text: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the built-in operators with their registered keys
    Ops {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show how a call would resolve for the given operands
    Explain {
        /// Operator name, e.g. `aten::mul.Tensor`
        op: String,

        /// Positional operand: `cpu`, `cuda`, `meta`, optionally suffixed
        /// with `:grad`, `:neg`, or `:zero`; or a numeric literal
        #[arg(long = "operand")]
        operand: Vec<String>,

        /// Enable a mode for the call (supported: `logging`)
        #[arg(long)]
        mode: Option<String>,

        /// Execute the call after planning it
        #[arg(long)]
        run: bool,

        /// Path to a dispatcher config TOML
        #[arg(long)]
        config: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

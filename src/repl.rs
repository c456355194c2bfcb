use std::io::{BufRead, Write};
use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

use crate::commands::{CommandResult, Context};
use crate::judge::Judge;
use crate::scheduler::Scheduler;

const HELP_TEXT: &str = "\
Commands:
  /study [quick]      Study due concepts (Enter does the same)
  /stats              Show statistics
  /list [sources]     List concepts, or sources (/ls)
  /due                Show what is due
  /skip <name>        Skip a concept
  /unskip [name]      Restore a skipped concept, or list skipped ones
  /config             Show configuration
  /help               Show this help (/h, /?)
  /quit               Exit (/exit, /q)

During study:
  finish an answer with a blank line
  type 'skip' to skip the current concept, 'quit' to stop";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Study { quick: bool },
    Stats,
    List { sources: bool },
    Due,
    Skip(String),
    Unskip(Option<String>),
    Config,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplParseError {
    #[error("Unknown command: /{0}")]
    UnknownCommand(String),

    #[error("Unknown input")]
    NotACommand,
}

impl FromStr for ReplCommand {
    type Err = ReplParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(ReplCommand::Study { quick: false });
        }

        let Some(rest) = input.strip_prefix('/') else {
            return Err(ReplParseError::NotACommand);
        };
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };

        match name.to_lowercase().as_str() {
            "study" => Ok(ReplCommand::Study {
                quick: matches!(args, "quick" | "-q" | "--quick"),
            }),
            "stats" => Ok(ReplCommand::Stats),
            "list" | "ls" => Ok(ReplCommand::List {
                sources: matches!(args, "sources" | "-s" | "--sources"),
            }),
            "due" => Ok(ReplCommand::Due),
            "skip" => Ok(ReplCommand::Skip(args.to_string())),
            "unskip" => Ok(ReplCommand::Unskip(
                Some(args.to_string()).filter(|a| !a.is_empty()),
            )),
            "config" => Ok(ReplCommand::Config),
            "help" | "h" | "?" => Ok(ReplCommand::Help),
            "quit" | "exit" | "q" => Ok(ReplCommand::Quit),
            other => Err(ReplParseError::UnknownCommand(other.to_string())),
        }
    }
}

/// Interactive prompt over the same handlers the CLI subcommands use.
pub struct Repl<'a> {
    ctx: &'a Context<'a>,
    judges: &'a [&'a dyn Judge],
}

impl<'a> Repl<'a> {
    pub fn new(ctx: &'a Context<'a>, judges: &'a [&'a dyn Judge]) -> Self {
        Self { ctx, judges }
    }

    pub fn run<R: BufRead, W: Write>(&self, input: &mut R, out: &mut W) -> CommandResult {
        self.print_status(out)?;

        loop {
            write!(out, "learnlock> ")?;
            out.flush()?;

            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                writeln!(out)?;
                break;
            }

            match line.parse::<ReplCommand>() {
                Ok(ReplCommand::Quit) => break,
                Ok(command) => {
                    debug!(?command, "repl command");
                    if let Err(e) = self.dispatch(command, input, out) {
                        writeln!(out, "Error: {}", e)?;
                    }
                }
                Err(e) => {
                    writeln!(out, "{}", e)?;
                    writeln!(out, "Type /help for available commands")?;
                }
            }
            writeln!(out)?;
        }

        writeln!(out, "Goodbye!")?;
        Ok(())
    }

    fn dispatch<R: BufRead, W: Write>(
        &self,
        command: ReplCommand,
        input: &mut R,
        out: &mut W,
    ) -> CommandResult {
        match command {
            ReplCommand::Study { quick } => self.ctx.study_with(self.judges, quick, input, out),
            ReplCommand::Stats => self.ctx.stats(out),
            ReplCommand::List { sources: true } => self.ctx.source_list(out),
            ReplCommand::List { sources: false } => self.ctx.concept_list(out),
            ReplCommand::Due => self.ctx.due(out),
            ReplCommand::Skip(name) => self.ctx.skip(&name, out),
            ReplCommand::Unskip(name) => self.ctx.unskip(name.as_deref(), out),
            ReplCommand::Config => self.ctx.show_config(out),
            ReplCommand::Help => {
                writeln!(out, "{}", HELP_TEXT)?;
                Ok(())
            }
            ReplCommand::Quit => Ok(()),
        }
    }

    fn print_status<W: Write>(&self, out: &mut W) -> CommandResult {
        let config = self.ctx.config;
        let summary =
            Scheduler::new(self.ctx.db, &config.scheduler, &config.grading).summary()?;

        writeln!(out, "learnlock {}", env!("CARGO_PKG_VERSION"))?;
        writeln!(
            out,
            "{} concepts, {} due, {} mastered",
            summary.total_concepts, summary.due_now, summary.mastered
        )?;
        if self.judges.is_empty() {
            writeln!(out, "No judge configured: set GEMINI_API_KEY or GROQ_API_KEY to study.")?;
        }
        writeln!(out, "Type /help for commands. Press Enter to start studying.")?;
        writeln!(out)?;
        Ok(())
    }
}

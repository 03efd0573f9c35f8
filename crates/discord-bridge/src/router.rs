//! Command routing for prefix-stripped messages.
//!
//! The first whitespace-separated token selects the command (case-insensitive);
//! the rest of the content is passed as the argument string. `help` is built in.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::message::InboundMessage;
use crate::middleware::MessageHandler;

/// Future returned by a command handler.
pub type HandlerFuture<'a> = BoxFuture<'a, anyhow::Result<()>>;

/// A command handler: `(message, args)`.
pub type CommandHandler =
    Arc<dyn for<'a> Fn(&'a InboundMessage, &'a str) -> HandlerFuture<'a> + Send + Sync>;

#[derive(Clone)]
pub struct CommandInfo {
    pub name: String,
    pub description: String,
    pub usage: String,
    handler: CommandHandler,
}

impl fmt::Debug for CommandInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandInfo")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

/// Split content into a lowercased command name and the remaining arguments.
pub fn split_command(content: &str) -> (String, &str) {
    let content = content.trim_start();
    match content.split_once(char::is_whitespace) {
        Some((name, args)) => (name.to_lowercase(), args.trim_start()),
        None => (content.to_lowercase(), ""),
    }
}

pub struct CommandRouter {
    prefix: String,
    commands: BTreeMap<String, CommandInfo>,
    default_handler: Option<CommandHandler>,
}

impl CommandRouter {
    /// `prefix` is only used to render help text.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            commands: BTreeMap::new(),
            default_handler: None,
        }
    }

    /// Register `handler` under `name`. Re-registering a name replaces it.
    ///
    /// ```ignore
    /// router.command("echo", "Echo back your message", "<text>", |msg, args| {
    ///     Box::pin(async move {
    ///         msg.reply(if args.is_empty() { "Nothing to echo" } else { args }).await?;
    ///         Ok(())
    ///     })
    /// });
    /// ```
    pub fn command<F>(
        &mut self,
        name: &str,
        description: impl Into<String>,
        usage: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        F: for<'a> Fn(&'a InboundMessage, &'a str) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        let name = name.to_lowercase();
        debug!(command = %name, "Registered command");
        self.commands.insert(
            name.clone(),
            CommandInfo {
                name,
                description: description.into(),
                usage: usage.into(),
                handler: Arc::new(handler),
            },
        );
        self
    }

    /// Handler for anything that isn't a registered command.
    pub fn default_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a InboundMessage, &'a str) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.default_handler = Some(Arc::new(handler));
        self
    }

    /// Registered commands, sorted by name.
    pub fn commands(&self) -> impl Iterator<Item = &CommandInfo> {
        self.commands.values()
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(&name.to_lowercase())
    }

    /// Route `message`. Returns whether a handler ran.
    ///
    /// Handler errors are logged and reported back to the channel; they never
    /// propagate to the caller.
    pub async fn handle(&self, message: &InboundMessage) -> bool {
        let (name, args) = split_command(message.content());
        debug!(command = %name, "Routing command");

        if name == "help" {
            if let Err(e) = message.reply(&self.help_text()).await {
                warn!(error = %e, "Failed to send help text");
            }
            return true;
        }

        if let Some(info) = self.commands.get(&name) {
            if let Err(e) = (info.handler)(message, args).await {
                error!(command = %name, error = %e, "Command handler failed");
                let notice = format!("Error executing command: {e}");
                if let Err(send_err) = message.reply(&notice).await {
                    warn!(error = %send_err, "Failed to report command error");
                }
            }
            return true;
        }

        if let Some(handler) = &self.default_handler {
            return match handler(message, args).await {
                Ok(()) => true,
                Err(e) => {
                    error!(error = %e, "Default handler failed");
                    false
                }
            };
        }

        debug!(command = %name, "No handler for command");
        false
    }

    /// Help listing in name order.
    pub fn help_text(&self) -> String {
        let mut lines = vec!["**Available Commands:**\n".to_string()];
        for info in self.commands.values() {
            let mut line = format!("`{}{}`", self.prefix, info.name);
            if !info.description.is_empty() {
                line.push_str(&format!(" - {}", info.description));
            }
            if !info.usage.is_empty() {
                line.push_str(&format!("\n  Usage: `{}{} {}`", self.prefix, info.name, info.usage));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

#[async_trait]
impl MessageHandler for CommandRouter {
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<()> {
        CommandRouter::handle(self, message).await;
        Ok(())
    }
}

use russh::client::Prompt;

use crate::{error::ServerError, session::Session, ssh::terminal::Terminal};

// Default remote selection prompt: banner, numbered menu, then a parse
// loop until the user picks a valid entry or aborts. Only called with two
// or more remotes; the zero/one cases short-circuit in the session forward.
pub(crate) async fn default_interactive(
    terminal: &mut Terminal<'_>,
    session: &Session,
) -> Result<usize, ServerError> {
    let remotes = &session.remotes;
    if remotes.is_empty() {
        return Err(ServerError::NoRemotes);
    }
    terminal
        .write(&format!("Welcome to sshmux, {}\r\n", session.user))
        .await?;
    for (index, remote) in remotes.iter().enumerate() {
        terminal
            .write(&format!("    [{index}] {}\r\n", remote.description))
            .await?;
    }
    loop {
        terminal.write("Please select remote server: ").await?;
        let line = terminal.read_line(false).await?;
        let input = String::from_utf8_lossy(&line);
        let Ok(choice) = input.parse::<i64>() else {
            terminal
                .write("input not a valid integer. Please try again\r\n")
                .await?;
            continue;
        };
        if choice < 0 || choice as usize >= remotes.len() {
            terminal
                .write("No such server. Please try again\r\n")
                .await?;
            continue;
        }
        return Ok(choice as usize);
    }
}

// Prompt for a password to use against the remote host. Input is hidden.
pub(crate) async fn password_prompt(
    terminal: &mut Terminal<'_>,
    user: &str,
    address: &str,
) -> Result<String, ServerError> {
    terminal.write(&format!("{user}@{address}: ")).await?;
    let line = terminal.read_line(true).await?;
    Ok(String::from_utf8_lossy(&line).into_owned())
}

// Relay a keyboard-interactive challenge from the remote host to the user,
// echoing each answer only when the remote says so.
pub(crate) async fn keyboard_challenge(
    terminal: &mut Terminal<'_>,
    instructions: &str,
    prompts: &[Prompt],
) -> Result<Vec<String>, ServerError> {
    if !instructions.is_empty() {
        terminal.write(&format!("{instructions}\n")).await?;
    }
    let mut answers = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        terminal.write(&format!("{}: ", prompt.prompt)).await?;
        let line = terminal.read_line(!prompt.echo).await?;
        answers.push(String::from_utf8_lossy(&line).into_owned());
    }
    Ok(answers)
}

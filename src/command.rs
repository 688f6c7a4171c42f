//! Operator command channel.
//!
//! Lines typed by the operator are matched against a fixed table of named
//! operations; anything else is rejected with `UnknownCommand`. Names are
//! case-insensitive, arguments may be separated by spaces or commas and may
//! be wrapped in parentheses:
//!
//! ```text
//! setCurrent 25
//! set_psu_ramp(100, 10)
//! trigger
//! ```
//!
//! A failed command is reported back on the channel and the channel keeps
//! reading. `exit` stops the channel only; acquisition carries on.

use crate::error::{AppResult, DaqError};
use crate::supply::Supply;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info};

pub const PROMPT: &str = "Enter command: ";

pub const HELP: &str = "\
Commands (case-insensitive, arguments separated by spaces or commas):
  setVoltage | set_psu_voltage <volts>      set voltage (protection raised first)
  setCurrent | set_psu_current <amps>       set current, refused at or above the ceiling
  planRamp   | set_psu_ramp <amps> <amps/s> program and arm a ramp to <amps>
  trigger    | start_ramp                   start the armed ramp
  shutdown   | set_psu_shutdown             zero the current and switch the output off
  output     | set_psu_output <on|off>      switch the output
  status                                    read back the supply setpoints
  help                                      this text
  exit                                      close the command channel; logging continues";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatorCommand {
    SetVoltage(f64),
    SetCurrent(f64),
    PlanRamp { target: f64, rate: f64 },
    Trigger,
    Shutdown,
    Output(bool),
    Status,
    Help,
    Exit,
}

fn expect_args(name: &str, args: &[&str], count: usize) -> AppResult<()> {
    if args.len() != count {
        return Err(DaqError::InvalidArgument(format!(
            "{} takes {} argument(s), got {}",
            name,
            count,
            args.len()
        )));
    }
    Ok(())
}

fn number(arg: &str) -> AppResult<f64> {
    arg.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DaqError::InvalidArgument(format!("'{}' is not a number", arg)))
}

fn switch(arg: &str) -> AppResult<bool> {
    match arg.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(DaqError::InvalidArgument(format!(
            "'{}' is not on or off",
            arg
        ))),
    }
}

impl FromStr for OperatorCommand {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        let (name, rest) = match line.find(|c: char| c == '(' || c.is_whitespace()) {
            Some(i) => line.split_at(i),
            None => (line, ""),
        };

        let rest = rest.trim();
        let rest = match rest.strip_prefix('(') {
            Some(inner) => inner.strip_suffix(')').ok_or_else(|| {
                DaqError::InvalidArgument(format!("unbalanced parentheses in '{}'", line))
            })?,
            None => rest,
        };
        let args: Vec<&str> = rest
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|a| !a.is_empty())
            .collect();

        let command = match name.to_ascii_lowercase().as_str() {
            "setvoltage" | "set_psu_voltage" => {
                expect_args(name, &args, 1)?;
                OperatorCommand::SetVoltage(number(args[0])?)
            }
            "setcurrent" | "set_psu_current" => {
                expect_args(name, &args, 1)?;
                OperatorCommand::SetCurrent(number(args[0])?)
            }
            "planramp" | "set_psu_ramp" => {
                expect_args(name, &args, 2)?;
                OperatorCommand::PlanRamp {
                    target: number(args[0])?,
                    rate: number(args[1])?,
                }
            }
            "output" | "set_psu_output" => {
                expect_args(name, &args, 1)?;
                OperatorCommand::Output(switch(args[0])?)
            }
            other => {
                let command = match other {
                    "trigger" | "start_ramp" => OperatorCommand::Trigger,
                    "shutdown" | "set_psu_shutdown" => OperatorCommand::Shutdown,
                    "status" => OperatorCommand::Status,
                    "help" => OperatorCommand::Help,
                    "exit" => OperatorCommand::Exit,
                    _ => return Err(DaqError::UnknownCommand(line.to_string())),
                };
                expect_args(name, &args, 0)?;
                command
            }
        };
        Ok(command)
    }
}

/// Runs parsed commands against the supply.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    supply: Supply,
}

impl CommandDispatcher {
    pub fn new(supply: Supply) -> Self {
        Self { supply }
    }

    /// Execute one command and describe the result for the operator.
    pub async fn dispatch(&self, command: OperatorCommand) -> AppResult<String> {
        let reply = match command {
            OperatorCommand::SetVoltage(volts) => {
                self.supply.set_voltage(volts).await?;
                format!("Voltage set to {} V", volts)
            }
            OperatorCommand::SetCurrent(amps) => {
                self.supply.set_current(amps).await?;
                format!("Current set to {} A", amps)
            }
            OperatorCommand::PlanRamp { target, rate } => {
                let plan = self.supply.plan_ramp(target, rate).await?;
                format!(
                    "Ramp armed: {} A -> {} A at {} A/s over {} s",
                    plan.start, plan.target, plan.rate, plan.duration
                )
            }
            OperatorCommand::Trigger => {
                self.supply.trigger().await?;
                "Ramp started".to_string()
            }
            OperatorCommand::Shutdown => {
                self.supply.shutdown().await?;
                "Supply shut down: current 0, output off".to_string()
            }
            OperatorCommand::Output(on) => {
                self.supply.set_output(on).await?;
                format!("Output {}", if on { "on" } else { "off" })
            }
            OperatorCommand::Status => {
                let s = self.supply.status().await?;
                format!(
                    "Current setpoint {} A, voltage {} V, protection {} V, output {}, ramp {:?}",
                    s.current_setpoint,
                    s.voltage_setpoint,
                    s.protection_level,
                    if s.output_enabled { "on" } else { "off" },
                    s.phase
                )
            }
            OperatorCommand::Help => HELP.to_string(),
            OperatorCommand::Exit => "Command channel closed".to_string(),
        };
        Ok(reply)
    }
}

/// Line-oriented operator input, independent of the acquisition loop.
pub struct CommandChannel<R, W> {
    input: R,
    output: W,
    dispatcher: CommandDispatcher,
}

impl<R, W> CommandChannel<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(input: R, output: W, dispatcher: CommandDispatcher) -> Self {
        Self {
            input,
            output,
            dispatcher,
        }
    }

    async fn say(&mut self, text: &str) -> AppResult<()> {
        self.output.write_all(text.as_bytes()).await?;
        self.output.write_all(b"\n").await?;
        self.output.flush().await?;
        Ok(())
    }

    /// Read and execute commands until `exit` or end of input.
    ///
    /// Returns the number of commands that completed successfully.
    pub async fn run(mut self) -> AppResult<usize> {
        let mut completed = 0;
        let mut line = String::new();

        loop {
            self.output.write_all(PROMPT.as_bytes()).await?;
            self.output.flush().await?;

            line.clear();
            if self.input.read_line(&mut line).await? == 0 {
                info!("Command input closed");
                break;
            }
            let text = line.trim();
            if text.is_empty() {
                continue;
            }

            let command = match text.parse::<OperatorCommand>() {
                Ok(command) => command,
                Err(e) => {
                    error!(input = text, error = %e, "Rejected operator command");
                    let message = format!("Error: {}", e);
                    self.say(&message).await?;
                    continue;
                }
            };

            info!(?command, "Operator command");
            match self.dispatcher.dispatch(command).await {
                Ok(reply) => {
                    completed += 1;
                    self.say(&reply).await?;
                }
                Err(e) => {
                    error!(?command, error = %e, "Operator command failed");
                    self.say(&format!("Error: {}", e)).await?;
                }
            }

            if command == OperatorCommand::Exit {
                self.say("Data logging continues").await?;
                break;
            }
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::instruments::Instruments;

    #[test]
    fn test_parse_aliases_and_call_syntax() {
        assert_eq!(
            "set_psu_ramp(100, 10)".parse::<OperatorCommand>().unwrap(),
            OperatorCommand::PlanRamp { target: 100.0, rate: 10.0 }
        );
        assert_eq!(
            "PLANRAMP 100 10".parse::<OperatorCommand>().unwrap(),
            OperatorCommand::PlanRamp { target: 100.0, rate: 10.0 }
        );
        assert_eq!(
            "setVoltage 2.5".parse::<OperatorCommand>().unwrap(),
            OperatorCommand::SetVoltage(2.5)
        );
        assert_eq!(
            "set_psu_output(0)".parse::<OperatorCommand>().unwrap(),
            OperatorCommand::Output(false)
        );
        assert_eq!(
            "start_ramp()".parse::<OperatorCommand>().unwrap(),
            OperatorCommand::Trigger
        );
        assert_eq!("  Exit ".parse::<OperatorCommand>().unwrap(), OperatorCommand::Exit);
    }

    #[test]
    fn test_parse_rejects_everything_else() {
        assert!(matches!(
            "__import__('os').system('rm -rf /')".parse::<OperatorCommand>(),
            Err(DaqError::UnknownCommand(_))
        ));
        assert!(matches!(
            "setCurrent".parse::<OperatorCommand>(),
            Err(DaqError::InvalidArgument(_))
        ));
        assert!(matches!(
            "setCurrent 1+1".parse::<OperatorCommand>(),
            Err(DaqError::InvalidArgument(_))
        ));
        assert!(matches!(
            "setCurrent nan".parse::<OperatorCommand>(),
            Err(DaqError::InvalidArgument(_))
        ));
        assert!(matches!(
            "trigger now".parse::<OperatorCommand>(),
            Err(DaqError::InvalidArgument(_))
        ));
        assert!(matches!(
            "set_psu_ramp(100, 10".parse::<OperatorCommand>(),
            Err(DaqError::InvalidArgument(_))
        ));
    }

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.supply.opc_poll_interval_ms = 1;
        settings
    }

    #[tokio::test]
    async fn test_errors_do_not_end_channel() {
        let (instruments, bench) = Instruments::simulated(&settings());
        let dispatcher = CommandDispatcher::new(instruments.supply.clone());
        let input: &[u8] = b"setCurrent 600\nbogus\ntrigger\n\nplanRamp 100 10\nexit\nsetCurrent 5\n";
        let mut output = Vec::new();

        let completed = CommandChannel::new(input, &mut output, dispatcher)
            .run()
            .await
            .unwrap();

        // planRamp and exit
        assert_eq!(completed, 2);
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("Error: Requested current 600 is not below the ceiling of 550"));
        assert!(text.contains("Error: Unknown command: bogus"));
        assert!(text.contains("Error: No ramp is armed"));
        assert!(text.contains("over 10 s"));
        assert!(text.contains("Data logging continues"));
        assert!(instruments.supply.is_armed());
        // nothing after exit reached the device
        assert!(!bench.supply.calls().contains(&"SOUR:CURR 5".to_string()));
    }

    #[tokio::test]
    async fn test_status_reports_setpoints() {
        let (instruments, _bench) = Instruments::simulated(&settings());
        let dispatcher = CommandDispatcher::new(instruments.supply.clone());
        dispatcher
            .dispatch(OperatorCommand::SetVoltage(2.0))
            .await
            .unwrap();

        let reply = dispatcher.dispatch(OperatorCommand::Status).await.unwrap();
        assert!(reply.contains("voltage 2 V"));
        assert!(reply.contains("protection 3 V"));
        assert!(reply.contains("ramp Idle"));
    }
}

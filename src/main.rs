use clap::{Arg, ArgAction, ArgMatches, Command};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Child;

use livesync::logging::*;
use livesync::serve::{self, ServeOptions};
use livesync::{CompareBy, InitialSyncStrategy, RpcClient, Session, StreamJoint, SyncConfig};

///////////////////////
// Utility functions //
///////////////////////

fn strings(matches: &ArgMatches, id: &str) -> Vec<String> {
	matches.get_many::<String>(id).map(|v| v.cloned().collect()).unwrap_or_default()
}

fn exclude_arg(id: &'static str, long: &'static str, help: &'static str) -> Arg {
	Arg::new(id).long(long).value_name("PATTERN").action(ArgAction::Append).help(help)
}

fn load_config(matches: &ArgMatches) -> Result<SyncConfig, Box<dyn Error>> {
	let mut config = match matches.get_one::<String>("config") {
		Some(path) => SyncConfig::load(Path::new(path))?,
		None => SyncConfig::default(),
	};

	if let Some(strategy) = matches.get_one::<String>("initial-sync") {
		config.initial_sync = strategy.parse::<InitialSyncStrategy>()?;
	}
	if let Some(compare) = matches.get_one::<String>("compare-by") {
		config.compare_by = compare.parse::<CompareBy>()?;
	}
	config.exclude_paths.extend(strings(matches, "exclude"));
	config.upload_exclude_paths.extend(strings(matches, "upload-exclude"));
	config.download_exclude_paths.extend(strings(matches, "download-exclude"));
	if matches.get_flag("polling") {
		config.polling = true;
	}
	Ok(config)
}

/// Arguments appended to the remote command for one leg
fn helper_args(leg: &str, remote_dir: &str, config: &SyncConfig) -> Vec<String> {
	let mut args = vec![format!("serve-{}", leg), remote_dir.to_string()];
	for pattern in config.effective_excludes() {
		args.push("--exclude".to_string());
		args.push(pattern);
	}
	args.push("--heartbeat-timeout".to_string());
	args.push(config.heartbeat_timeout_secs.to_string());
	match leg {
		"upstream" if config.override_permissions => args.push("--override-permissions".to_string()),
		"downstream" if config.polling => args.push("--polling".to_string()),
		_ => {}
	}
	args
}

/// Start one remote helper and connect an RPC client to its stdio
fn spawn_helper(
	command: &[String],
	leg: &str,
	remote_dir: &str,
	config: &SyncConfig,
) -> Result<(Child, RpcClient), Box<dyn Error>> {
	let (program, args) = command.split_first().ok_or("sync: remote command required")?;
	let mut cmd = tokio::process::Command::new(program);
	cmd.args(args).args(helper_args(leg, remote_dir, config));

	debug!("[{}] Spawning {:?}", leg, cmd);
	let mut child = cmd
		.stdin(Stdio::piped())
		.stdout(Stdio::piped())
		.stderr(Stdio::inherit())
		.kill_on_drop(true)
		.spawn()
		.map_err(|e| format!("Cannot start {}: {}", program, e))?;

	let stdout = child.stdout.take().ok_or("helper stdout not captured")?;
	let stdin = child.stdin.take().ok_or("helper stdin not captured")?;
	Ok((child, RpcClient::new(StreamJoint::new(stdout, stdin))))
}

async fn run_sync(matches: &ArgMatches) -> Result<bool, Box<dyn Error>> {
	let local_dir =
		matches.get_one::<String>("local-dir").ok_or("sync: local directory argument required")?;
	let remote_dir = matches.get_one::<String>("remote-dir").map(String::as_str).unwrap_or(".");
	let command = strings(matches, "command");
	let config = load_config(matches)?;

	let (_up_child, upstream) = spawn_helper(&command, "upstream", remote_dir, &config)?;
	let (_down_child, downstream) = spawn_helper(&command, "downstream", remote_dir, &config)?;

	let session = Session::start(Path::new(local_dir), config, upstream, downstream).await?;
	let (up_done, down_done, done) =
		(session.upstream_initial_done(), session.downstream_initial_done(), session.done());
	tokio::spawn(async move {
		up_done.cancelled().await;
		down_done.cancelled().await;
		eprintln!("Initial sync done, watching for changes");
	});

	tokio::select! {
		_ = done.cancelled() => {}
		_ = tokio::signal::ctrl_c() => {
			info!("Interrupted");
			session.stop();
		}
	}

	match session.error().await {
		Some(err) => {
			eprintln!("Sync failed: {}", err);
			Ok(false)
		}
		None => Ok(true),
	}
}

fn serve_options(matches: &ArgMatches) -> ServeOptions {
	let defaults = ServeOptions::default();
	ServeOptions {
		exclude: strings(matches, "exclude"),
		heartbeat_timeout: matches
			.get_one::<u64>("heartbeat-timeout")
			.map_or(defaults.heartbeat_timeout, |secs| Duration::from_secs(*secs)),
		polling: matches.try_get_one::<bool>("polling").ok().flatten().copied().unwrap_or(false),
		override_permissions: matches
			.try_get_one::<bool>("override-permissions")
			.ok()
			.flatten()
			.copied()
			.unwrap_or(false),
		..defaults
	}
}

fn heartbeat_arg() -> Arg {
	Arg::new("heartbeat-timeout")
		.long("heartbeat-timeout")
		.value_name("SECS")
		.value_parser(clap::value_parser!(u64))
		.help("Exit when no ping arrived for this long")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	init_tracing();

	let matches = Command::new("livesync")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Bidirectional live directory sync")
		.subcommand_required(true)
		.subcommand(
			Command::new("sync")
				.about("Sync a local directory with a remote one")
				.arg(Arg::new("local-dir").required(true))
				.arg(
					Arg::new("command")
						.required(true)
						.last(true)
						.num_args(1..)
						.help("Command starting the remote helper, e.g. ssh host livesync"),
				)
				.arg(
					Arg::new("remote-dir")
						.long("remote-dir")
						.value_name("DIR")
						.help("Directory served by the remote helper"),
				)
				.arg(Arg::new("config").short('c').long("config").value_name("FILE"))
				.arg(Arg::new("initial-sync").long("initial-sync").value_name("STRATEGY"))
				.arg(Arg::new("compare-by").long("compare-by").value_name("COMPARISON"))
				.arg(exclude_arg("exclude", "exclude", "Exclude from both directions"))
				.arg(exclude_arg("upload-exclude", "upload-exclude", "Never upload"))
				.arg(exclude_arg("download-exclude", "download-exclude", "Never download"))
				.arg(
					Arg::new("polling")
						.long("polling")
						.action(ArgAction::SetTrue)
						.help("Poll the remote tree instead of watching it"),
				),
		)
		.subcommand(
			Command::new("serve-upstream")
				.about("Remote helper for the upload leg (used internally)")
				.arg(Arg::new("dir").required(true))
				.arg(exclude_arg("exclude", "exclude", "Never remove"))
				.arg(heartbeat_arg())
				.arg(
					Arg::new("override-permissions")
						.long("override-permissions")
						.action(ArgAction::SetTrue),
				),
		)
		.subcommand(
			Command::new("serve-downstream")
				.about("Remote helper for the download leg (used internally)")
				.arg(Arg::new("dir").required(true))
				.arg(exclude_arg("exclude", "exclude", "Never report"))
				.arg(heartbeat_arg())
				.arg(Arg::new("polling").long("polling").action(ArgAction::SetTrue)),
		)
		.get_matches();

	match matches.subcommand() {
		Some(("sync", sub)) => {
			if !run_sync(sub).await? {
				std::process::exit(1);
			}
		}
		Some(("serve-upstream", sub)) => {
			let dir = sub.get_one::<String>("dir").ok_or("serve: directory argument required")?;
			serve::serve_upstream(&PathBuf::from(dir), serve_options(sub)).await?;
		}
		Some(("serve-downstream", sub)) => {
			let dir = sub.get_one::<String>("dir").ok_or("serve: directory argument required")?;
			serve::serve_downstream(&PathBuf::from(dir), serve_options(sub)).await?;
		}
		_ => return Err("unknown subcommand".into()),
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_helper_args_carry_session_settings() {
		let config = SyncConfig {
			exclude_paths: vec!["build/".to_string()],
			heartbeat_timeout_secs: 30,
			polling: true,
			..Default::default()
		};

		let args = helper_args("downstream", "/srv/app", &config);
		assert_eq!(
			args,
			vec![
				"serve-downstream",
				"/srv/app",
				"--exclude",
				".livesync/",
				"--exclude",
				"build/",
				"--heartbeat-timeout",
				"30",
				"--polling",
			]
		);

		let args = helper_args("upstream", ".", &config);
		assert!(!args.contains(&"--polling".to_string()));
	}
}

// vim: ts=4

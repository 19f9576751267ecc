use std::{path::PathBuf, process, sync::Arc};

use clap::ArgMatches;
use colored::Colorize;
use failure::{format_err, Error};
use log::{error, info, warn};

use mastf_core::{
    cli::generate_cli,
    dispatch::{executor::WorkerPool, DispatchReport, ScanRequest, Scheduler},
    error::status_code,
    initialize_config, initialize_logger,
    observer::StatusBoard,
    query, scanners,
    store::Store,
    tools::SystemTools,
    Config, Result,
};

fn main() {
    let cli = generate_cli().get_matches();
    initialize_logger(cli.is_present("verbose"));

    if let Err(e) = run(&cli) {
        print_error(&e);
        process::exit(1);
    }
}

fn run(cli: &ArgMatches<'_>) -> Result<()> {
    let mut config = initialize_config(cli)?;
    for file in config.loaded_config_files() {
        info!("loaded configuration from `{}`", file.display());
    }
    for message in config.errors() {
        warn!("{}", message);
    }

    match cli.subcommand() {
        ("scanners", _) => list_scanners(&config),
        ("scan", Some(scan)) => {
            // Results live in memory, so the process has to outlive the scan.
            config.set_wait_for_completion(true);
            run_scan(config, scan)
        }
        _ => Err(format_err!("no subcommand given")),
    }
}

fn list_scanners(config: &Config) -> Result<()> {
    let registry = scanners::default_registry(config)?;
    for plugin in registry.all().values() {
        let extensions = plugin
            .extensions()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{} ({})",
            plugin.name().bold(),
            plugin.internal_name().italic()
        );
        println!("    {}", plugin.help());
        println!("    results: {}", extensions);
    }
    Ok(())
}

fn run_scan(config: Config, cli: &ArgMatches<'_>) -> Result<()> {
    let file_path = PathBuf::from(cli.value_of("file").unwrap_or_default());
    let file_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| format_err!("`{}` is not a file", file_path.display()))?;
    let scanners = cli
        .values_of("scanner")
        .map(|values| values.map(String::from).collect())
        .unwrap_or_default();

    let config = Arc::new(config);
    let registry = Arc::new(scanners::default_registry(&config)?);
    let store = Arc::new(Store::new());
    let board = Arc::new(StatusBoard::new());
    let pool = Arc::new(WorkerPool::new(config.threads()));
    let tools = Arc::new(SystemTools::new(config.tool_timeout()));
    let scheduler = Scheduler::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        board,
        pool,
        Arc::clone(&config),
        tools,
    );

    let project_name = cli.value_of("project").unwrap_or("default");
    let project = match store.project_by_name(project_name) {
        Some(project) => project,
        None => store.create_project(project_name),
    };

    if !config.is_quiet() {
        println!("Starting analysis of {}.", file_name.italic());
    }
    let dispatch = scheduler.submit(ScanRequest {
        project: project.id,
        file_path,
        file_name,
        scan_type: cli.value_of("type").unwrap_or("android").to_owned(),
        scanners,
        start_date: None,
    })?;
    let scan_id = dispatch.scan();
    let report = dispatch.wait()?;

    if cli.is_present("json") {
        let summary = query::scan_summary(&registry, &store, scan_id)?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if !config.is_quiet() {
        print_report(&report);
        let scan = store.scan(scan_id)?;
        println!(
            "Scan {} is {:?}, risk level {}.",
            scan.id,
            scan.status,
            scan.risk_level.to_string().bold()
        );
    }

    if report.is_success() {
        Ok(())
    } else {
        Err(format_err!("{} scanner(s) failed", report.failed.len()))
    }
}

fn print_report(report: &DispatchReport) {
    for unit in &report.succeeded {
        println!("  {} {}: {}", "✔".green(), unit.scanner, unit.state);
    }
    for unit in &report.failed {
        println!("  {} {}: {}", "✘".red(), unit.scanner, unit.error);
    }
}

fn print_error(e: &Error) {
    error!("{} (status {})", e, status_code(e));
    for cause in e.iter_causes() {
        error!("caused by: {}", cause);
    }
}

//! Command line interface.

use clap::{crate_version, App, AppSettings, Arg, SubCommand};

/// Generates the command line interface.
pub fn generate_cli() -> App<'static, 'static> {
    App::new("MAST-F")
        .version(crate_version!())
        .author("MatrixEditor")
        .about("Mobile Application Security Testing Framework: runs scanner plugins over apps")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .setting(AppSettings::VersionlessSubcommands)
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .global(true)
                .conflicts_with("quiet")
                .help("If you'd like the auditor to talk more than necessary"),
        )
        .arg(
            Arg::with_name("quiet")
                .short("q")
                .long("quiet")
                .global(true)
                .help("If you'd like a zen auditor that won't output anything but errors"),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .takes_value(true)
                .global(true)
                .help("Configuration file to load instead of the default locations"),
        )
        .arg(
            Arg::with_name("threads")
                .long("threads")
                .value_name("THREADS")
                .takes_value(true)
                .global(true)
                .help("Number of worker threads running scanners"),
        )
        .arg(
            Arg::with_name("timeout")
                .long("timeout")
                .value_name("SECONDS")
                .takes_value(true)
                .global(true)
                .help("Seconds a scanner may run before it is considered failed"),
        )
        .arg(
            Arg::with_name("projects")
                .long("projects")
                .value_name("FOLDER")
                .takes_value(true)
                .global(true)
                .help("Folder where uploads and scan working trees are stored"),
        )
        .arg(
            Arg::with_name("wait")
                .long("wait")
                .global(true)
                .help("Waits until every scanner finished before returning"),
        )
        .subcommand(
            SubCommand::with_name("scan")
                .about("Scans a file with the selected scanners")
                .arg(
                    Arg::with_name("file")
                        .value_name("FILE")
                        .required(true)
                        .help("File to scan, usually an APK"),
                )
                .arg(
                    Arg::with_name("project")
                        .short("p")
                        .long("project")
                        .value_name("NAME")
                        .takes_value(true)
                        .default_value("default")
                        .help("Project the scan belongs to, created if missing"),
                )
                .arg(
                    Arg::with_name("scanner")
                        .short("s")
                        .long("scanner")
                        .value_name("SCANNER")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1)
                        .required(true)
                        .help("Scanner to run, can be repeated"),
                )
                .arg(
                    Arg::with_name("type")
                        .short("t")
                        .long("type")
                        .value_name("TYPE")
                        .takes_value(true)
                        .default_value("android")
                        .help("Scan type"),
                )
                .arg(
                    Arg::with_name("json")
                        .long("json")
                        .help("Prints the results as JSON"),
                ),
        )
        .subcommand(SubCommand::with_name("scanners").about("Lists the available scanners"))
}

use clap::Parser;
use spark_print::cli::{format_printer, run, Cli, Commands};
use spark_print::contract::{Job, Printer, PrinterType};
use spark_print::fleet::{NormalizedStatus, PrinterView};

fn view() -> PrinterView {
    let mut status = NormalizedStatus {
        printer_status: Some("printing".into()),
        job_id: Some("job-1".into()),
        ..Default::default()
    };
    status.data.seconds_left = Some(90);
    PrinterView {
        printer: Printer {
            printer_id: "p1".into(),
            printer_name: "Lab Ember".into(),
            type_id: "ember".into(),
            firmware: None,
            status: None,
        },
        printer_type: Some(PrinterType {
            id: "ember".into(),
            name: "Ember".into(),
            manufacturer: None,
        }),
        owner: None,
        printer_members: Vec::new(),
        status,
        job: Some(Job {
            job_id: "job-1".into(),
            printer_id: Some("p1".into()),
            job_status: None,
            progress: None,
            job_name: Some("bracket".into()),
        }),
    }
}

#[test]
fn parses_job_commands() {
    let cli = Cli::try_parse_from([
        "spark-print",
        "pause",
        "--config",
        "spark.yaml",
        "--printer",
        "p1",
    ])
    .expect("valid arguments");
    match cli.command {
        Commands::Pause { config, printer } => {
            assert_eq!(config.to_str(), Some("spark.yaml"));
            assert_eq!(printer, "p1");
        }
        _ => panic!("expected pause"),
    }
}

#[test]
fn job_commands_require_a_printer() {
    assert!(Cli::try_parse_from(["spark-print", "cancel", "--config", "spark.yaml"]).is_err());
}

#[test]
fn printer_line_shows_status_time_and_job() {
    let line = format_printer(&view());
    assert!(line.starts_with("Lab Ember"));
    assert!(line.contains("Ember"));
    assert!(line.contains("printing"));
    assert!(line.contains("90s left"));
    assert!(line.contains("job bracket"));
}

#[tokio::test]
async fn run_fails_for_missing_config() {
    let cli = Cli::try_parse_from(["spark-print", "printers", "--config", "/no/such/file.yaml"])
        .unwrap();
    assert!(run(cli).await.is_err());
}

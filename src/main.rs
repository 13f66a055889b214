use chrono::Local;
use flexi_logger::{FileSpec, Logger};
use gepistasis::param::{self, Param};
use gepistasis::{cinfo, run};
use log::{error, info};
use std::process;

fn start_logger(param: &Param) -> Result<flexi_logger::LoggerHandle, flexi_logger::FlexiLoggerError> {
    let logger = Logger::try_with_env_or_str(&param.general.log_level)?;
    if param.general.log_base.is_empty() {
        logger.log_to_stderr().start()
    } else {
        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        logger
            .log_to_file(
                FileSpec::default()
                    .basename(format!("{}_{}", param.general.log_base, timestamp))
                    .suppress_timestamp()
                    .suffix(&param.general.log_suffix),
            )
            .start()
    }
}

fn main() {
    let param_path = std::env::args().nth(1).unwrap_or_else(|| "param.yaml".to_string());

    // checked by `run` once the logger is up, so that its warnings are kept
    let param = match param::load(&param_path) {
        Ok(param) => param,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    // dropping the handle stops logging
    let _logger = match start_logger(&param) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Can't start the logger: {}", e);
            process::exit(1);
        }
    };

    info!("gepistasis v{}", gepistasis::version());

    let experiment = match run(&param) {
        Ok(experiment) => experiment,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    cinfo!(
        experiment.parameters.general.display_colorful,
        "{}",
        experiment.display_results()
    );

    if !param.general.save_exp.is_empty() {
        if let Err(e) = experiment.save_auto(&param.general.save_exp) {
            error!("Can't save experiment to {}: {}", param.general.save_exp, e);
            process::exit(1);
        }
        info!("Experiment saved to {}", param.general.save_exp);
    }
}

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    let version = env!("CARGO_PKG_VERSION");
    if !args.extended {
        println!("relaypeer {version}");
        return Ok(SUCCESS);
    }

    println!("name: relaypeer");
    println!("version: {version}");
    println!(
        "build_target: {}",
        option_env!("RELAYPEER_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "features: async={}, cli=true",
        cfg!(feature = "async")
    );
    println!(
        "defaults: chunk_size={}, request_timeout={}s",
        relaypeer_peer::DEFAULT_CHUNK_SIZE,
        relaypeer_peer::DEFAULT_REQUEST_TIMEOUT.as_secs()
    );

    Ok(SUCCESS)
}

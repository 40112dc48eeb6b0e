use crate::cmd::InfoArgs;
use crate::connection::Connection;
use crate::exit::{api_error, CliResult, SUCCESS};

pub fn run(args: InfoArgs) -> CliResult<i32> {
    let connection = Connection::open(&args.uri)?;

    let outcome = (|| -> CliResult<()> {
        let api = &connection.api;
        println!(
            "product:  {}",
            api.prodid().map_err(|err| api_error("prodid", err))?
        );
        println!(
            "version:  {}",
            api.verstring().map_err(|err| api_error("verstring", err))?
        );
        println!("channels: {}", connection.channels());
        if !connection.is_local() {
            println!("leased:   channel {}", connection.channel_id(0));
        }
        Ok(())
    })();

    connection.close();
    outcome.map(|()| SUCCESS)
}

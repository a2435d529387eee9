use std::io;

fn main() -> io::Result<()> {
    agentgate_mcp_client::stub_server::run()
}

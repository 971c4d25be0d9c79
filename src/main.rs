use cached_file_server::http::parse_request_head;
use cached_file_server::{
    watch, ConnectionAcceptor, DirectoryHandler, FileServer, Method, Request, Response,
    ServerConfig, ServerError, ServerResult, Status,
};
use log::{debug, info, warn};
use std::env;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> ServerResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command-line arguments
    let args: Vec<String> = env::args().collect();
    let config = match args.get(1) {
        Some(path) if Path::new(path).exists() => ServerConfig::from_json_file(path)?,
        _ => ServerConfig::new(),
    };

    let result = run(config);
    watch::shutdown();
    result
}

fn run(config: ServerConfig) -> ServerResult<()> {
    let server = Arc::new(FileServer::with_capacity(report_error, config.cache_capacity));
    let handler = server.serve_directory(
        &config.root_directory,
        config.mime_types.clone(),
        config.max_age,
    )?;

    let address = config.socket_address();
    let acceptor = Arc::new(ConnectionAcceptor::new(&address)?);

    info!(
        "Serving {} on {} with {} worker threads",
        config.root_directory.display(),
        address,
        config.worker_threads
    );

    // Close every file watch before exiting on Ctrl-C
    ctrlc::set_handler(move || {
        info!("Received shutdown signal. Stopping server...");
        watch::shutdown();
        std::process::exit(0);
    })
    .map_err(|e| ServerError::Config(format!("Error setting Ctrl-C handler: {}", e)))?;

    if config.stats_interval_secs > 0 {
        let server = server.clone();
        let interval = Duration::from_secs(config.stats_interval_secs);
        thread::spawn(move || loop {
            thread::sleep(interval);
            if let Some(stats) = server.cache_stats() {
                info!("Content cache: {}", stats);
            }
        });
    }

    let mut handles = Vec::with_capacity(config.worker_threads);

    for id in 0..config.worker_threads.max(1) {
        let acceptor = acceptor.clone();
        let handler = handler.clone();
        let max_header_size = config.max_header_size;

        let handle = thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || loop {
                match acceptor.accept() {
                    Ok((stream, peer)) => {
                        if let Err(e) = handle_connection(stream, &handler, max_header_size) {
                            debug!("Connection from {} failed: {}", peer, e);
                        }
                    }
                    Err(e) => warn!("Worker {} failed to accept: {}", id, e),
                }
            })?;
        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

/// Error sink for the binary: 404s become 404 responses, everything else a 500
fn report_error(error: ServerError, request: &Request, response: &mut Response) {
    let status = match error.code() {
        Some(404) => Status::NotFound,
        _ => {
            warn!("{} {} failed: {}", request.method.as_str(), request.uri, error);
            Status::InternalServerError
        }
    };

    response.headers.clear();
    response.body.clear();
    response.write_head(status);
    response.set_header("Content-Type", "text/plain");
    let _ = response.write_all(status.as_str().as_bytes());
    response.end();
}

fn handle_connection(
    mut stream: TcpStream,
    handler: &DirectoryHandler,
    max_header_size: usize,
) -> ServerResult<()> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    let request = loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..n]);

        match parse_request_head(&buffer) {
            Ok(Some(request)) => break request,
            Ok(None) if buffer.len() <= max_header_size => continue,
            Ok(None) => return reject(&mut stream, Status::BadRequest),
            Err(e) => {
                debug!("Rejecting malformed request: {}", e);
                return reject(&mut stream, Status::BadRequest);
            }
        }
    };

    let mut response = Response::new();
    match request.method {
        Method::Get | Method::Head => handler.handle(&request, &mut response),
        _ => {
            response.write_head(Status::MethodNotAllowed);
            response.set_header("Allow", "GET, HEAD");
        }
    }

    debug!(
        "{} {} - {}",
        request.method.as_str(),
        request.uri,
        response.status.code()
    );

    let mut out = Vec::with_capacity(response.body.len() + 256);
    response.serialize(&mut out, request.method != Method::Head)?;
    stream.write_all(&out)?;
    Ok(())
}

fn reject(stream: &mut TcpStream, status: Status) -> ServerResult<()> {
    let mut response = Response::new();
    response.write_head(status);

    let mut out = Vec::new();
    response.serialize(&mut out, true)?;
    stream.write_all(&out)?;
    Ok(())
}

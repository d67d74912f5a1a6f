mod dispatch_flow;
mod socks_flow;

pub mod checksum;
pub mod config;
pub mod daemon;
pub mod netif;
pub mod pause;
pub mod rawsock;
pub mod ring;
pub mod signals;
pub mod translate;
pub mod tun;

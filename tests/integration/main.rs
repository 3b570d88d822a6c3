
mod activities;
mod burn;
mod friends;
mod profiles;
mod requests;
mod sessions;

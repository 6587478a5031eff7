fn main() {
    tiller::run();
}
